//! Static song manifest.
//!
//! Raw notation stays in flash (`&'static str` in rodata); the catalog only
//! copies names into RAM at startup and parses note arrays on demand.

use crate::notes::SongFormat;

/// One manifest entry: display name, notation format, raw text.
pub struct SongDef {
    pub name: &'static str,
    pub format: SongFormat,
    pub text: &'static str,
}

const fn rtttl(name: &'static str, text: &'static str) -> SongDef {
    SongDef { name, format: SongFormat::Rtttl, text }
}

const fn mml(name: &'static str, text: &'static str) -> SongDef {
    SongDef { name, format: SongFormat::Mml, text }
}

pub const SONG_DEFS: &[SongDef] = &[
    rtttl(
        "Korobeiniki (Tetris)",
        "Korobeiniki:d=4,o=5,b=160:e6,8b,8c6,d6,8c6,8b,a,8a,8c6,e6,8d6,8c6,b,8b,8c6,d6,e6,c6,a,2a,8p,d6,8f6,a6,8g6,8f6,e6,8e6,8c6,e6,8d6,8c6,b,8b,8c6,d6,e6,c6,a,a",
    ),
    rtttl(
        "Ode to Joy",
        "OdeToJoy:d=4,o=5,b=125:e,e,f,g,g,f,e,d,c,c,d,e,e.,8d,2d,e,e,f,g,g,f,e,d,c,c,d,e,d.,8c,2c",
    ),
    rtttl(
        "Fur Elise",
        "FurElise:d=8,o=5,b=125:e6,d_6,e6,d_6,e6,b,d6,c6,4a,p,c,e,a,4b,p,e,g_,b,4c6,p,e,e6,d_6,e6,d_6,e6,b,d6,c6,4a,p,c,e,a,4b,p,e,c6,b,2a",
    ),
    rtttl(
        "Greensleeves",
        "Greensleeves:d=4,o=5,b=140:g,2a_,c6,d6.,8d_6,d6,2c6,a,f.,8g,a,2a_,g,g.,8f,g,2a,f,2d,g,2a_,c6,d6.,8e6,d6,2c6,a,f.,8g,a,a_.,8a,g,2f_,f_,2g",
    ),
    rtttl(
        "Entertainer",
        "Entertainer:d=4,o=5,b=140:8d,8d_,8e,c6,8e,c6,8e,2c6.,8c6,8d6,8d_6,8e6,8c6,8d6,e6,8b,d6,2c6,p,8d,8d_,8e,c6,8e,c6,8e,2c6.,8p,8a,8g,8f_,8a,8c6,e6,8d6,8c6,8a,2d6",
    ),
    rtttl(
        "In the Hall of the Mountain King",
        "MountainKing:d=8,o=5,b=140:d,e,f,g,a,f,4a,g_,e,4g_,g,d_,4g,p,d,e,f,g,a,f,a,d6,c6,a,f,a,4c6",
    ),
    rtttl(
        "Scale Test",
        "Scale:d=8,o=5,b=120:c,d,e,f,g,a,b,c6",
    ),
    mml(
        "Twinkle Twinkle (duet)",
        "MML@t100 l4 cc gg aa g2 ff ee dd c2,t100 l4 rr ee ff e2 dd cc <b>< b> c2;",
    ),
    mml(
        "Canon Fragment (3 voices)",
        "MML@t70 l2 >cg<ab- fcfg,t70 l2 egfd dege,t70 l2 r1 >cg<ab-;",
    ),
    mml(
        "Arpeggio Round (4 voices)",
        "MML@t140 l8 ceg>c<geceg>c<ge,t140 l8 r2 ceg>c<geceg>c<ge,t140 l4 c<g>ce,t140 l1 r c;",
    ),
    mml(
        "March (bass + lead)",
        "MML@t120 l8 o5 g4 g4 a4 b4 g4 b a g e4 g4 f+4 g2,t120 l4 o3 g d g d e d e g;",
    ),
];
