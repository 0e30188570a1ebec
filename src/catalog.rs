//! Song catalog: many definitions resident in flash, at most one parsed.
//!
//! Startup records names and track counts only. A song's note arrays are
//! materialized on first play and freed before the next song parses —
//! explicit eviction, not garbage collection. One trailing slot is reserved
//! for the generation worker's output; its raw text lives in RAM and is
//! rewritten on each successful generation.

use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::config::{MAX_NOTES_PER_SONG, MAX_TRACKS, SONG_TEXT_MAX};
use crate::notes::{Note, SongFormat};
use crate::songs::SongDef;
use crate::{mml, rtttl};

/// Where a song's raw notation lives.
pub enum SongSource {
    /// Manifest text in rodata.
    Flash(&'static str),
    /// Generated MML owned by this entry; dropped on rewrite.
    Ram(String),
}

impl SongSource {
    fn text(&self) -> &str {
        match self {
            SongSource::Flash(s) => s,
            SongSource::Ram(s) => s,
        }
    }
}

pub struct SongEntry {
    pub source: SongSource,
    pub name: String,
    pub format: SongFormat,
    pub track_count: usize,
    pub parsed: bool,
    pub tracks: [Option<Arc<[Note]>>; MAX_TRACKS],
}

impl SongEntry {
    fn unparsed(source: SongSource, name: String, format: SongFormat, track_count: usize) -> Self {
        Self {
            source,
            name,
            format,
            track_count,
            parsed: false,
            tracks: Default::default(),
        }
    }

    /// Iterate the non-empty parsed tracks in track order.
    pub fn active_tracks(&self) -> impl Iterator<Item = &Arc<[Note]>> {
        self.tracks.iter().flatten().filter(|t| !t.is_empty())
    }
}

/// Row shape of `/songs.json`.
#[derive(Serialize)]
pub struct SongRow<'a> {
    pub i: usize,
    pub n: &'a str,
    pub t: usize,
}

pub struct Catalog {
    entries: Vec<SongEntry>,
}

/// Name shown for the generated slot in `playing:` broadcasts.
const GENERATED_NAME: &str = "Generated";

impl Catalog {
    /// Build the catalog from the manifest plus the trailing generated slot.
    pub fn new(defs: &[SongDef]) -> Self {
        let mut entries: Vec<SongEntry> = defs
            .iter()
            .map(|def| {
                let track_count = match def.format {
                    SongFormat::Rtttl => 1,
                    SongFormat::Mml => mml::count_tracks(def.text),
                };
                SongEntry::unparsed(
                    SongSource::Flash(def.text),
                    def.name.to_string(),
                    def.format,
                    track_count,
                )
            })
            .collect();

        entries.push(SongEntry::unparsed(
            SongSource::Ram(String::new()),
            GENERATED_NAME.to_string(),
            SongFormat::Mml,
            0,
        ));

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the reserved generated slot (one past the manifest songs).
    pub fn generated_index(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn entry(&self, index: usize) -> Option<&SongEntry> {
        self.entries.get(index)
    }

    /// Materialize note arrays for a song. No-op when already parsed.
    /// Returns false when the text is over the size bound or yields no notes.
    pub fn parse(&mut self, index: usize) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        if entry.parsed {
            return true;
        }

        let text = entry.source.text();
        if text.len() >= SONG_TEXT_MAX {
            warn!("song '{}' text too long ({} bytes)", entry.name, text.len());
            return false;
        }

        // Parsers emit into bounded vectors; each kept track is then copied
        // into an exactly-sized shared slice.
        let mut any = false;
        match entry.format {
            SongFormat::Rtttl => {
                let notes = rtttl::parse(text, MAX_NOTES_PER_SONG);
                if !notes.is_empty() {
                    entry.tracks[0] = Some(Arc::from(notes.as_slice()));
                    any = true;
                }
            }
            SongFormat::Mml => {
                let parsed = mml::parse_tracks(text, MAX_TRACKS, MAX_NOTES_PER_SONG);
                for (t, notes) in parsed.into_iter().enumerate() {
                    if !notes.is_empty() {
                        entry.tracks[t] = Some(Arc::from(notes.as_slice()));
                        any = true;
                    }
                }
            }
        }

        if !any {
            warn!("song '{}' parsed to zero notes", entry.name);
            return false;
        }
        entry.parsed = true;
        true
    }

    /// Free a song's parsed tracks. The caller must have detached every
    /// player reference first so the note arrays are actually released.
    pub fn evict(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            if entry.parsed {
                entry.tracks = Default::default();
                entry.parsed = false;
            }
        }
    }

    /// Replace the generated slot's MML, evicting its previous contents.
    /// The old RAM buffer is dropped with the overwritten source.
    pub fn install_generated(&mut self, mml_text: String) {
        let index = self.generated_index();
        self.evict(index);
        let entry = &mut self.entries[index];
        entry.track_count = mml::count_tracks(&mml_text).min(MAX_TRACKS);
        entry.source = SongSource::Ram(mml_text);
    }

    /// Rows for `/songs.json`: the manifest songs only, never the
    /// generated slot.
    pub fn song_rows(&self) -> Vec<SongRow<'_>> {
        self.entries[..self.generated_index()]
            .iter()
            .enumerate()
            .map(|(i, e)| SongRow {
                i,
                n: &e.name,
                t: e.track_count.min(MAX_TRACKS),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::SongFormat;

    fn test_catalog() -> Catalog {
        const DEFS: &[SongDef] = &[
            SongDef {
                name: "Mono",
                format: SongFormat::Rtttl,
                text: "Mono:d=4,o=5,b=125:8c5,8e5,8g5,c6",
            },
            SongDef {
                name: "Quad",
                format: SongFormat::Mml,
                text: "MML@t120 cdef,t120 efga,t120 gabc,t120 rccc;",
            },
            SongDef {
                name: "Broken",
                format: SongFormat::Rtttl,
                text: "nothing to see",
            },
        ];
        Catalog::new(DEFS)
    }

    #[test]
    fn startup_records_names_and_track_counts_only() {
        let cat = test_catalog();
        assert_eq!(cat.len(), 4); // 3 songs + generated slot
        assert_eq!(cat.entry(0).unwrap().track_count, 1);
        assert_eq!(cat.entry(1).unwrap().track_count, 4);
        assert!(!cat.entry(0).unwrap().parsed);
        assert!(cat.entry(0).unwrap().tracks.iter().all(|t| t.is_none()));
    }

    #[test]
    fn parse_materializes_and_evict_frees() {
        let mut cat = test_catalog();
        assert!(cat.parse(1));
        let entry = cat.entry(1).unwrap();
        assert!(entry.parsed);
        assert_eq!(entry.active_tracks().count(), 4);

        cat.evict(1);
        let entry = cat.entry(1).unwrap();
        assert!(!entry.parsed);
        assert!(entry.tracks.iter().all(|t| t.is_none()));
    }

    #[test]
    fn parse_is_idempotent_and_reproducible() {
        let mut cat = test_catalog();
        assert!(cat.parse(0));
        let first: Vec<Note> = cat.entry(0).unwrap().tracks[0].as_ref().unwrap().to_vec();

        // Parse again without evicting: no-op.
        assert!(cat.parse(0));

        // Evict and reparse: byte-identical notes.
        cat.evict(0);
        assert!(cat.parse(0));
        let second: Vec<Note> = cat.entry(0).unwrap().tracks[0].as_ref().unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_note_parse_fails_and_stays_unparsed() {
        let mut cat = test_catalog();
        assert!(!cat.parse(2));
        assert!(!cat.entry(2).unwrap().parsed);
    }

    #[test]
    fn generated_slot_roundtrip() {
        let mut cat = test_catalog();
        let idx = cat.generated_index();
        assert!(!cat.parse(idx), "empty generated slot must not parse");

        cat.install_generated("MML@t120 ceg>c;".to_string());
        assert_eq!(cat.entry(idx).unwrap().track_count, 1);
        assert!(cat.parse(idx));
        assert_eq!(cat.entry(idx).unwrap().active_tracks().count(), 1);

        // Reinstall evicts the old parse and replaces the buffer.
        cat.install_generated("MML@t120 c,t120 e;".to_string());
        let entry = cat.entry(idx).unwrap();
        assert!(!entry.parsed);
        assert_eq!(entry.track_count, 2);
    }

    #[test]
    fn song_rows_exclude_generated_slot() {
        let cat = test_catalog();
        let rows = cat.song_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].n, "Quad");
        assert_eq!(rows[1].t, 4);
    }

    #[test]
    fn evicted_tracks_release_their_memory() {
        let mut cat = test_catalog();
        cat.parse(0);
        let track = cat.entry(0).unwrap().tracks[0].as_ref().unwrap().clone();
        assert_eq!(Arc::strong_count(&track), 2);
        cat.evict(0);
        // Catalog reference gone; only the test's clone keeps it alive.
        assert_eq!(Arc::strong_count(&track), 1);
    }
}
