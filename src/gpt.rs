//! Mini-GPT inference kernel: a quantized decoder-only transformer that
//! writes MML text one token at a time.
//!
//! The `MGPT` model file is read from SPIFFS into one 4-byte-aligned buffer;
//! every weight tensor is an (offset, length) view into that buffer, so
//! loading copies nothing but the token table. Weights are per-row INT8
//! with FP32 row scales, dequantized on the fly inside the mat-vec product.
//! A KV cache of shape `[n_layer, block_size, n_embd]` makes each decode
//! step constant work in sequence length.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Result};
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::sys;
use log::info;

/// Sampling a PAD or EOS token ends generation.
pub const PAD_TOKEN: usize = 0;
pub const EOS_TOKEN: usize = 2;

/// Why a generation run ended without producing a melody. Callers match on
/// this rather than inspecting shared flags, so the classification cannot
/// race with a concurrent `gen:stop`.
#[derive(Debug)]
pub enum GenError {
    /// The abort flag was raised; the partial output is discarded.
    Aborted,
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenError::Aborted => write!(f, "generation aborted"),
        }
    }
}

impl std::error::Error for GenError {}

const MAGIC: &[u8; 4] = b"MGPT";
const HEADER_LEN: usize = 32;
const QUANT_INT8: u8 = 1;

/// Longest token the prompt encoder will try to match.
const MAX_TOKEN_BYTES: usize = 16;
const MAX_PROMPT_TOKENS: usize = 128;

const TOP_K: usize = 40;
const REP_WINDOW: usize = 30;
const REP_PENALTY: f32 = 1.2;

/// Logit sentinel for values cut by top-k; large and negative but finite so
/// the softmax stays NaN-free.
const CUT_LOGIT: f32 = -1e9;

// ── Aligned model storage ──────────────────────────────────────────────────

/// Byte buffer backed by `u32` words so FP32 tensor views are always aligned.
struct AlignedBytes {
    words: Vec<u32>,
    len: usize,
}

impl AlignedBytes {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u32; len.div_ceil(4)],
            len,
        }
    }

    #[cfg(test)]
    fn from_vec(bytes: Vec<u8>) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.bytes_mut().copy_from_slice(&bytes);
        buf
    }

    fn len(&self) -> usize {
        self.len
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    /// FP32 view. `off` must be word-aligned, which the layout walker
    /// guarantees by construction.
    fn f32s(&self, t: TensorF32) -> &[f32] {
        debug_assert_eq!(t.off % 4, 0);
        unsafe { slice::from_raw_parts(self.bytes().as_ptr().add(t.off) as *const f32, t.len) }
    }

    fn i8s(&self, t: TensorI8) -> &[i8] {
        unsafe { slice::from_raw_parts(self.bytes().as_ptr().add(t.off) as *const i8, t.len) }
    }
}

#[derive(Clone, Copy)]
struct TensorF32 {
    off: usize,
    len: usize,
}

#[derive(Clone, Copy)]
struct TensorI8 {
    off: usize,
    len: usize,
}

/// Bounds-checked offset walker over the weight section of the file.
struct Layout {
    off: usize,
    total: usize,
}

impl Layout {
    fn f32s(&mut self, len: usize) -> Result<TensorF32> {
        let t = TensorF32 { off: self.off, len };
        self.advance(len * 4)?;
        Ok(t)
    }

    fn i8s(&mut self, len: usize) -> Result<TensorI8> {
        let t = TensorI8 { off: self.off, len };
        self.advance(len)?;
        Ok(t)
    }

    fn align4(&mut self) {
        self.off = (self.off + 3) & !3;
    }

    fn advance(&mut self, bytes: usize) -> Result<()> {
        self.off = self
            .off
            .checked_add(bytes)
            .filter(|&end| end <= self.total)
            .ok_or_else(|| anyhow!("model file truncated at offset {}", self.off))?;
        Ok(())
    }
}

// ── Model ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GptConfig {
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_tokens: usize,
}

struct LayerWeights {
    norm1_gamma: TensorF32,
    wq: TensorI8,
    q_scale: TensorF32,
    wk: TensorI8,
    k_scale: TensorF32,
    wv: TensorI8,
    v_scale: TensorF32,
    wo: TensorI8,
    o_scale: TensorF32,
    norm2_gamma: TensorF32,
    w_up: TensorI8,
    up_scale: TensorF32,
    w_down: TensorI8,
    down_scale: TensorF32,
}

struct Weights {
    tok_emb: TensorF32,
    pos_emb: TensorF32,
    layers: Vec<LayerWeights>,
    final_norm_gamma: TensorF32,
    w_lm: TensorI8,
    lm_scale: TensorF32,
}

/// Activation scratch, allocated once from the configuration.
struct Buffers {
    x: Vec<f32>,
    xb: Vec<f32>,
    q: Vec<f32>,
    att: Vec<f32>,
    mlp: Vec<f32>,
    logits: Vec<f32>,
}

pub struct MiniGpt {
    data: AlignedBytes,
    pub config: GptConfig,
    tokens: Vec<String>,
    weights: Weights,
    k_cache: Vec<f32>,
    v_cache: Vec<f32>,
    buffers: Buffers,
    pos: usize,
}

impl MiniGpt {
    /// Read and validate the model file, build the zero-copy tensor views,
    /// and allocate the KV cache and scratch.
    pub fn load(path: &str) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_LEN {
            bail!("model file too small ({len} bytes)");
        }
        let mut data = AlignedBytes::zeroed(len);
        file.read_exact(data.bytes_mut())?;
        info!("model file read: {len} bytes");
        Self::from_data(data)
    }

    fn from_data(data: AlignedBytes) -> Result<Self> {
        let bytes = data.bytes();
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            bail!("bad model magic");
        }
        let version = bytes[4];
        if version != 1 {
            bail!("unsupported model version {version}");
        }
        let quant = bytes[5];
        if quant != QUANT_INT8 {
            bail!("unsupported quantization type {quant}");
        }

        let u16_at = |off: usize| usize::from(u16::from_le_bytes([bytes[off], bytes[off + 1]]));
        let config = GptConfig {
            n_embd: u16_at(6),
            n_layer: usize::from(bytes[8]),
            n_head: usize::from(bytes[9]),
            block_size: u16_at(10),
            vocab_size: u16_at(12),
            n_tokens: u16_at(14),
        };
        if config.n_embd == 0
            || config.n_layer == 0
            || config.n_head == 0
            || config.n_embd % config.n_head != 0
            || config.block_size == 0
            || config.vocab_size == 0
        {
            bail!("nonsensical model config: {config:?}");
        }
        info!(
            "model config: n_embd={} n_layer={} n_head={} block_size={} vocab={}",
            config.n_embd, config.n_layer, config.n_head, config.block_size, config.vocab_size
        );

        // Token table: one length byte then raw bytes, per vocab entry.
        let mut off = HEADER_LEN;
        let mut tokens = Vec::with_capacity(config.vocab_size);
        for _ in 0..config.vocab_size {
            let tok_len = usize::from(
                *bytes
                    .get(off)
                    .ok_or_else(|| anyhow!("token table truncated"))?,
            );
            off += 1;
            let raw = bytes
                .get(off..off + tok_len)
                .ok_or_else(|| anyhow!("token table truncated"))?;
            tokens.push(String::from_utf8_lossy(raw).into_owned());
            off += tok_len;
        }

        let mut layout = Layout {
            off,
            total: data.len(),
        };
        layout.align4();

        let embd = config.n_embd;
        let tok_emb = layout.f32s(config.vocab_size * embd)?;
        let pos_emb = layout.f32s(config.block_size * embd)?;

        let mut layers = Vec::with_capacity(config.n_layer);
        for _ in 0..config.n_layer {
            layers.push(LayerWeights {
                norm1_gamma: layout.f32s(embd)?,
                wq: layout.i8s(embd * embd)?,
                q_scale: layout.f32s(embd)?,
                wk: layout.i8s(embd * embd)?,
                k_scale: layout.f32s(embd)?,
                wv: layout.i8s(embd * embd)?,
                v_scale: layout.f32s(embd)?,
                wo: layout.i8s(embd * embd)?,
                o_scale: layout.f32s(embd)?,
                norm2_gamma: layout.f32s(embd)?,
                w_up: layout.i8s(4 * embd * embd)?,
                up_scale: layout.f32s(4 * embd)?,
                w_down: layout.i8s(embd * 4 * embd)?,
                down_scale: layout.f32s(embd)?,
            });
        }

        let weights = Weights {
            tok_emb,
            pos_emb,
            layers,
            final_norm_gamma: layout.f32s(embd)?,
            w_lm: layout.i8s(config.vocab_size * embd)?,
            lm_scale: layout.f32s(config.vocab_size)?,
        };

        let cache_len = config.n_layer * config.block_size * embd;
        let buffers = Buffers {
            x: vec![0.0; embd],
            xb: vec![0.0; embd],
            q: vec![0.0; embd],
            att: vec![0.0; config.n_head * config.block_size],
            mlp: vec![0.0; 4 * embd],
            logits: vec![0.0; config.vocab_size],
        };

        Ok(Self {
            data,
            config,
            tokens,
            weights,
            k_cache: vec![0.0; cache_len],
            v_cache: vec![0.0; cache_len],
            buffers,
            pos: 0,
        })
    }

    /// Greedy longest-match prompt encoding over the token table. Unknown
    /// bytes are skipped.
    fn encode(&self, prompt: &str) -> Vec<usize> {
        let bytes = prompt.as_bytes();
        let mut ids = Vec::new();
        let mut i = 0;
        while i < bytes.len() && ids.len() < MAX_PROMPT_TOKENS {
            let longest = MAX_TOKEN_BYTES.min(bytes.len() - i);
            let hit = (1..=longest).rev().find_map(|len| {
                let piece = &bytes[i..i + len];
                self.tokens
                    .iter()
                    .position(|t| t.as_bytes() == piece)
                    .map(|id| (id, len))
            });
            match hit {
                Some((id, len)) => {
                    ids.push(id);
                    i += len;
                }
                None => i += 1,
            }
        }
        ids
    }

    /// One forward step: feed `token` at the current position, leaving the
    /// next-token logits in scratch. The caller advances `pos`.
    fn forward(&mut self, token: usize) {
        let cfg = self.config.clone();
        let embd = cfg.n_embd;
        let head_dim = embd / cfg.n_head;
        let pos = self.pos;
        let data = &self.data;
        let w = &self.weights;
        let Buffers { x, xb, q, att, mlp, logits } = &mut self.buffers;

        // Token + position embedding.
        let tok_row = &data.f32s(w.tok_emb)[token * embd..(token + 1) * embd];
        let pos_row = &data.f32s(w.pos_emb)[pos * embd..(pos + 1) * embd];
        for i in 0..embd {
            x[i] = tok_row[i] + pos_row[i];
        }

        for (l, layer) in w.layers.iter().enumerate() {
            rmsnorm(xb, x, data.f32s(layer.norm1_gamma));

            matmul_int8(q, xb, data.i8s(layer.wq), data.f32s(layer.q_scale));

            let layer_off = l * cfg.block_size * embd;
            let k_row = &mut self.k_cache[layer_off + pos * embd..layer_off + (pos + 1) * embd];
            matmul_int8(k_row, xb, data.i8s(layer.wk), data.f32s(layer.k_scale));
            let v_row = &mut self.v_cache[layer_off + pos * embd..layer_off + (pos + 1) * embd];
            matmul_int8(v_row, xb, data.i8s(layer.wv), data.f32s(layer.v_scale));

            // Causal attention over the cache, one head at a time.
            let scale = 1.0 / (head_dim as f32).sqrt();
            for h in 0..cfg.n_head {
                let q_head = &q[h * head_dim..(h + 1) * head_dim];
                let att_head = &mut att[h * cfg.block_size..h * cfg.block_size + pos + 1];

                for (t, score) in att_head.iter_mut().enumerate() {
                    let k_t = &self.k_cache
                        [layer_off + t * embd + h * head_dim..][..head_dim];
                    *score = dot(q_head, k_t) * scale;
                }
                softmax(att_head);

                let out_head = &mut xb[h * head_dim..(h + 1) * head_dim];
                out_head.fill(0.0);
                for (t, &weight) in att_head.iter().enumerate() {
                    let v_t = &self.v_cache
                        [layer_off + t * embd + h * head_dim..][..head_dim];
                    for d in 0..head_dim {
                        out_head[d] += weight * v_t[d];
                    }
                }
            }

            matmul_int8(q, xb, data.i8s(layer.wo), data.f32s(layer.o_scale));
            for i in 0..embd {
                x[i] += q[i];
            }

            rmsnorm(xb, x, data.f32s(layer.norm2_gamma));
            matmul_int8(mlp, xb, data.i8s(layer.w_up), data.f32s(layer.up_scale));
            for m in mlp.iter_mut() {
                if *m < 0.0 {
                    *m = 0.0;
                }
            }
            matmul_int8(q, mlp, data.i8s(layer.w_down), data.f32s(layer.down_scale));
            for i in 0..embd {
                x[i] += q[i];
            }
        }

        rmsnorm(xb, x, data.f32s(w.final_norm_gamma));
        matmul_int8(logits, xb, data.i8s(w.w_lm), data.f32s(w.lm_scale));
    }

    /// Run a full generation: encode and replay the prompt, then sample up
    /// to `max_tokens` new tokens, streaming each token's text to `stream`.
    ///
    /// The result starts with the prompt text. Aborting returns
    /// `GenError::Aborted` after the current forward step and discards the
    /// partial output.
    pub fn generate(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        abort: &AtomicBool,
        mut stream: impl FnMut(&str),
    ) -> Result<String, GenError> {
        info!("generate: prompt={prompt:?} max_tokens={max_tokens} temp={temperature:.2}");

        self.pos = 0;
        let prompt_ids = self.encode(prompt);
        info!("prompt encoded to {} tokens", prompt_ids.len());

        for &id in &prompt_ids {
            if self.pos >= self.config.block_size - 1 {
                break;
            }
            self.forward(id);
            self.pos += 1;
        }

        let mut result = String::from(prompt);
        let mut recent = [0usize; REP_WINDOW];
        let mut recent_count = 0;
        let mut recent_idx = 0;
        let mut generated = 0;

        while generated < max_tokens && self.pos < self.config.block_size - 1 {
            if abort.load(Ordering::Relaxed) {
                return Err(GenError::Aborted);
            }

            // Sign-aware repetition penalty over the rolling window.
            for &tok in &recent[..recent_count] {
                let logit = &mut self.buffers.logits[tok];
                if *logit > 0.0 {
                    *logit /= REP_PENALTY;
                } else {
                    *logit *= REP_PENALTY;
                }
            }

            let next = sample_token(&self.buffers.logits, temperature, TOP_K, random_unit());
            if next == PAD_TOKEN || next == EOS_TOKEN {
                info!("EOS/PAD after {generated} tokens");
                break;
            }

            let text = self.tokens[next].clone();
            result.push_str(&text);
            stream(&text);

            recent[recent_idx] = next;
            recent_idx = (recent_idx + 1) % REP_WINDOW;
            recent_count = recent_count.min(REP_WINDOW - 1) + 1;

            self.forward(next);
            self.pos += 1;
            generated += 1;

            // Let the idle task and the main loop breathe.
            if generated % 10 == 0 {
                FreeRtos::delay_ms(1);
            }
        }

        info!("generation complete: {generated} tokens");
        Ok(result)
    }
}

// ── Math kernels ───────────────────────────────────────────────────────────

/// `y_i = x_i * gamma_i / sqrt(mean(x^2) + 1e-5)`
fn rmsnorm(out: &mut [f32], x: &[f32], gamma: &[f32]) {
    let mut ss = 0.0f32;
    for &v in x {
        ss += v * v;
    }
    let inv = 1.0 / (ss / x.len() as f32 + 1e-5).sqrt();
    for i in 0..out.len() {
        out[i] = x[i] * inv * gamma[i];
    }
}

/// `out[r] = (Σ_c w[r,c] * inp[c]) * scale[r]` over a row-major INT8 matrix.
fn matmul_int8(out: &mut [f32], inp: &[f32], w: &[i8], scales: &[f32]) {
    let cols = inp.len();
    for (r, o) in out.iter_mut().enumerate() {
        let row = &w[r * cols..(r + 1) * cols];
        let mut sum = 0.0f32;
        for (&wv, &iv) in row.iter().zip(inp) {
            sum += f32::from(wv) * iv;
        }
        *o = sum * scales[r];
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// In-place softmax with max subtraction for stability.
fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / (sum + 1e-10);
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// Temperature + top-k sampling against a uniform draw `u` in `[0, 1)`.
///
/// Top-k keeps the k largest scaled logits (partial selection for the
/// threshold) and cuts the rest to a large negative sentinel before the
/// softmax; the token is the first index whose cumulative probability
/// reaches `u`.
pub fn sample_token(logits: &[f32], temperature: f32, top_k: usize, u: f32) -> usize {
    let mut probs: Vec<f32> = logits.iter().map(|&l| l / temperature).collect();

    if top_k > 0 && top_k < probs.len() {
        let mut sorted = probs.clone();
        for i in 0..top_k {
            for j in i + 1..sorted.len() {
                if sorted[j] > sorted[i] {
                    sorted.swap(i, j);
                }
            }
        }
        let threshold = sorted[top_k - 1];
        for p in probs.iter_mut() {
            if *p < threshold {
                *p = CUT_LOGIT;
            }
        }
    }

    softmax(&mut probs);

    let mut cum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cum += p;
        if cum >= u {
            return i;
        }
    }
    0
}

/// Uniform draw in `[0, 1)` from the hardware RNG.
fn random_unit() -> f32 {
    let r = unsafe { sys::esp_random() };
    r as f32 / (u32::MAX as f32 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Sampling ─────────────────────────────────────────────────────

    #[test]
    fn top_k_one_is_argmax() {
        let logits = [0.1, 2.0, -1.0, 1.9];
        // u = 0.0 is excluded: a zero draw accepts the first index by the
        // `cum >= u` rule before any mass accumulates.
        for u in [0.1, 0.3, 0.7, 0.999] {
            assert_eq!(sample_token(&logits, 1.0, 1, u), 1);
        }
    }

    #[test]
    fn low_temperature_is_degenerate_greedy() {
        let logits = [0.1, 2.0, -1.0, 1.0];
        // At T=0.1 a one-point logit gap becomes a factor of e^10; the
        // argmax carries essentially all the mass.
        for u in [0.1, 0.5, 0.999] {
            assert_eq!(sample_token(&logits, 0.1, 40, u), 1);
        }
    }

    #[test]
    fn uniform_logits_follow_the_draw() {
        let logits = [0.0f32; 4];
        assert_eq!(sample_token(&logits, 1.0, 0, 0.0), 0);
        assert_eq!(sample_token(&logits, 1.0, 0, 0.30), 1);
        assert_eq!(sample_token(&logits, 1.0, 0, 0.60), 2);
        assert_eq!(sample_token(&logits, 1.0, 0, 0.99), 3);
    }

    #[test]
    fn top_k_cuts_the_tail() {
        let logits = [5.0, 4.0, -3.0, -4.0];
        // k=2: only the first two survive; even a late draw stays in them.
        assert!(sample_token(&logits, 1.0, 2, 0.999) <= 1);
    }

    // ── Model file loading ───────────────────────────────────────────

    const EMBD: usize = 4;
    const LAYERS: usize = 1;
    const HEADS: usize = 2;
    const BLOCK: usize = 8;
    const TOKENS: &[&str] = &["<pad>", "MML@", "<eos>", "c", "d", "e"];

    /// Serialize a tiny all-zero-weight model in the MGPT layout.
    fn tiny_model() -> Vec<u8> {
        let vocab = TOKENS.len();
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(1); // version
        out.push(QUANT_INT8);
        out.extend_from_slice(&(EMBD as u16).to_le_bytes());
        out.push(LAYERS as u8);
        out.push(HEADS as u8);
        out.extend_from_slice(&(BLOCK as u16).to_le_bytes());
        out.extend_from_slice(&(vocab as u16).to_le_bytes());
        out.extend_from_slice(&(vocab as u16).to_le_bytes()); // n_tokens
        out.extend_from_slice(&[0u8; 16]); // reserved, pads the header to 32

        for t in TOKENS {
            out.push(t.len() as u8);
            out.extend_from_slice(t.as_bytes());
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }

        let f32s = |out: &mut Vec<u8>, n: usize| out.extend(std::iter::repeat(0u8).take(n * 4));
        let i8s = |out: &mut Vec<u8>, n: usize| out.extend(std::iter::repeat(0u8).take(n));

        f32s(&mut out, vocab * EMBD); // tok_emb
        f32s(&mut out, BLOCK * EMBD); // pos_emb
        for _ in 0..LAYERS {
            f32s(&mut out, EMBD); // norm1
            for _ in 0..4 {
                i8s(&mut out, EMBD * EMBD); // q/k/v/o
                f32s(&mut out, EMBD);
            }
            f32s(&mut out, EMBD); // norm2
            i8s(&mut out, 4 * EMBD * EMBD);
            f32s(&mut out, 4 * EMBD);
            i8s(&mut out, EMBD * 4 * EMBD);
            f32s(&mut out, EMBD);
        }
        f32s(&mut out, EMBD); // final norm
        i8s(&mut out, vocab * EMBD); // lm head
        f32s(&mut out, vocab);
        out
    }

    fn tiny_gpt() -> MiniGpt {
        MiniGpt::from_data(AlignedBytes::from_vec(tiny_model())).unwrap()
    }

    #[test]
    fn loads_a_wellformed_file() {
        let gpt = tiny_gpt();
        assert_eq!(gpt.config.n_embd, EMBD);
        assert_eq!(gpt.config.vocab_size, TOKENS.len());
        assert_eq!(gpt.tokens[1], "MML@");
        assert_eq!(gpt.k_cache.len(), LAYERS * BLOCK * EMBD);
    }

    #[test]
    fn rejects_bad_magic_version_and_quant() {
        let mut bad = tiny_model();
        bad[0] = b'X';
        assert!(MiniGpt::from_data(AlignedBytes::from_vec(bad)).is_err());

        let mut bad = tiny_model();
        bad[4] = 9;
        assert!(MiniGpt::from_data(AlignedBytes::from_vec(bad)).is_err());

        let mut bad = tiny_model();
        bad[5] = 0;
        assert!(MiniGpt::from_data(AlignedBytes::from_vec(bad)).is_err());
    }

    #[test]
    fn rejects_truncated_weights() {
        let mut bad = tiny_model();
        bad.truncate(bad.len() - 8);
        assert!(MiniGpt::from_data(AlignedBytes::from_vec(bad)).is_err());
    }

    #[test]
    fn encode_greedy_longest_match() {
        let gpt = tiny_gpt();
        // "MML@" wins over any single-character match; unknown bytes skip.
        assert_eq!(gpt.encode("MML@cd"), vec![1, 3, 4]);
        assert_eq!(gpt.encode("zzc"), vec![3]);
        assert!(gpt.encode("!!!").is_empty());
    }

    #[test]
    fn forward_fills_logits_for_every_vocab_entry() {
        let mut gpt = tiny_gpt();
        gpt.forward(3);
        assert_eq!(gpt.buffers.logits.len(), TOKENS.len());
        assert!(gpt.buffers.logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn abort_flag_stops_generation() {
        let mut gpt = tiny_gpt();
        let abort = AtomicBool::new(true);
        let mut streamed = 0;
        let res = gpt.generate("MML@", 10, 1.0, &abort, |_| streamed += 1);
        assert!(matches!(res, Err(GenError::Aborted)));
        assert_eq!(streamed, 0);
    }
}
