//! Scripted in-memory backend shared by the integration tests
//!
//! - one token per character, `BOS` prepended when special tokens are requested
//! - the sampler replays a fixed reply script, then an end-of-generation token
//! - every decode, attention switch and clear is recorded in a call log
//! - failures can be injected per operation
//! - a [`Gate`] can hold every sampler call until the test releases it

#![allow(dead_code)]

use echollama::{
    BackendContext, BackendModel, BackendSampler, Batch, ChatMessage, ContextParams, EchoError,
    ImageEncoder, ModelBackend, ModelParams, Result, Runtime, SamplerParams, TokenId,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub const BOS: TokenId = 1;
pub const EOG: TokenId = 2;
const SCRIPT_BASE: TokenId = 2_000_000;
pub const N_EMBD: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Decode {
        n_tokens: usize,
        pos_0: i32,
        embedding: bool,
        tokens: Vec<TokenId>,
    },
    CausalAttn(bool),
    Clear,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    arrivals: usize,
}

/// Holds sampler calls until opened, counting every call that reached it
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().open = true;
        cvar.notify_all();
    }

    pub fn arrivals(&self) -> usize {
        self.inner.0.lock().unwrap().arrivals
    }

    /// Wait until `n` calls reached the gate. False on timeout.
    pub fn wait_for_arrivals(&self, n: usize, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let (state, _) = cvar
            .wait_timeout_while(lock.lock().unwrap(), timeout, |s| s.arrivals < n)
            .unwrap();
        state.arrivals >= n
    }

    fn pass(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap();
        state.arrivals += 1;
        cvar.notify_all();
        while !state.open {
            state = cvar.wait(state).unwrap();
        }
    }
}

#[derive(Debug)]
pub struct MockState {
    pub n_ctx: u32,
    pub reply: Vec<Vec<u8>>,
    pub never_eog: bool,
    pub calls: Vec<Call>,
    pub loads: Vec<PathBuf>,
    pub decode_calls: usize,
    pub fail_decode_at: Option<usize>,
    pub fail_embedding_decode: bool,
    pub fail_sample: bool,
    pub fail_template: bool,
    pub fail_tokenize: bool,
    pub fail_load: bool,
    pub fail_encode: bool,
    pub encoder_tokens: usize,
    pub encoder_embd: usize,
    pub encoder_short_output: bool,
    pub sample_gate: Option<Gate>,
    pub contexts_alive: usize,
    pub last_context_params: Option<ContextParams>,
    pub last_sampler_params: Option<SamplerParams>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            reply: vec![b"Hi".to_vec(), b" there".to_vec(), b"!".to_vec()],
            never_eog: false,
            calls: Vec::new(),
            loads: Vec::new(),
            decode_calls: 0,
            fail_decode_at: None,
            fail_embedding_decode: false,
            fail_sample: false,
            fail_template: false,
            fail_tokenize: false,
            fail_load: false,
            fail_encode: false,
            encoder_tokens: 4,
            encoder_embd: N_EMBD,
            encoder_short_output: false,
            sample_gate: None,
            contexts_alive: 0,
            last_context_params: None,
            last_sampler_params: None,
        }
    }
}

pub type Shared = Arc<Mutex<MockState>>;

#[derive(Clone, Default)]
pub struct MockBackend {
    pub state: Shared,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn decodes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Decode { .. }))
            .collect()
    }
}

impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<Box<dyn BackendModel>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_load {
            return Err(EchoError::ModelLoadError("rejected by backend".to_string()));
        }
        state.loads.push(path.to_path_buf());
        Ok(Box::new(MockModel {
            state: self.state.clone(),
        }))
    }

    fn load_image_encoder(
        &self,
        _path: &Path,
        _model: &dyn BackendModel,
    ) -> Result<Box<dyn ImageEncoder>> {
        Ok(Box::new(MockEncoder {
            state: self.state.clone(),
        }))
    }
}

pub struct MockModel {
    state: Shared,
}

/// Template used by the mock: `<|role|>content\n` per message
pub fn render_template(messages: &[ChatMessage], add_assistant: bool) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!("<|{}|>{}\n", msg.role.as_str(), msg.content));
    }
    if add_assistant {
        out.push_str("<|assistant|>");
    }
    out
}

pub fn char_tokens(text: &str) -> Vec<TokenId> {
    text.chars().map(|c| c as TokenId + 16).collect()
}

impl BackendModel for MockModel {
    fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId> {
        if self.state.lock().unwrap().fail_tokenize {
            return Vec::new();
        }
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(char_tokens(text));
        tokens
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        if token >= SCRIPT_BASE {
            let state = self.state.lock().unwrap();
            let idx = (token - SCRIPT_BASE) as usize;
            return state
                .reply
                .get(idx)
                .cloned()
                .ok_or_else(|| EchoError::BackendError(format!("unknown token {}", token)));
        }
        if token == BOS || token == EOG {
            return Ok(Vec::new());
        }
        let c = char::from_u32((token - 16) as u32)
            .ok_or_else(|| EchoError::BackendError(format!("unknown token {}", token)))?;
        Ok(c.to_string().into_bytes())
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> Result<usize> {
        if self.state.lock().unwrap().fail_template {
            return Err(EchoError::BackendError("template rejected".to_string()));
        }
        let rendered = render_template(messages, add_assistant);
        let bytes = rendered.as_bytes();
        if bytes.len() <= buf.len() {
            buf[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(bytes.len())
    }

    fn n_embd(&self) -> usize {
        N_EMBD
    }

    fn n_ctx_train(&self) -> u32 {
        8192
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn BackendContext>> {
        let mut state = self.state.lock().unwrap();
        state.contexts_alive += 1;
        state.last_context_params = Some(params.clone());
        Ok(Box::new(MockContext {
            state: self.state.clone(),
            n_ctx: state.n_ctx,
            used: 0,
        }))
    }

    fn new_sampler(&self, params: &SamplerParams) -> Result<Box<dyn BackendSampler>> {
        self.state.lock().unwrap().last_sampler_params = Some(params.clone());
        Ok(Box::new(MockSampler {
            state: self.state.clone(),
            cursor: 0,
        }))
    }
}

pub struct MockContext {
    state: Shared,
    n_ctx: u32,
    used: u32,
}

impl BackendContext for MockContext {
    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let call_index = state.decode_calls;
        state.decode_calls += 1;
        if state.fail_decode_at == Some(call_index) {
            return Err(EchoError::BackendError("decode failed".to_string()));
        }
        if batch.is_embedding() && state.fail_embedding_decode {
            return Err(EchoError::BackendError("embedding decode failed".to_string()));
        }
        if self.used + batch.len() as u32 > self.n_ctx {
            return Err(EchoError::BackendError("context overflow".to_string()));
        }
        state.calls.push(Call::Decode {
            n_tokens: batch.len(),
            pos_0: batch.positions().first().copied().unwrap_or(-1),
            embedding: batch.is_embedding(),
            tokens: batch.tokens().map(|t| t.to_vec()).unwrap_or_default(),
        });
        self.used += batch.len() as u32;
        Ok(())
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn used_cells(&self) -> u32 {
        self.used
    }

    fn clear(&mut self) {
        self.used = 0;
        self.state.lock().unwrap().calls.push(Call::Clear);
    }

    fn set_causal_attn(&mut self, causal: bool) {
        self.state.lock().unwrap().calls.push(Call::CausalAttn(causal));
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.contexts_alive -= 1;
        }
    }
}

pub struct MockSampler {
    state: Shared,
    cursor: usize,
}

impl BackendSampler for MockSampler {
    fn sample(&mut self, _ctx: &mut dyn BackendContext) -> Result<TokenId> {
        // waited on outside the state lock
        let gate = self.state.lock().unwrap().sample_gate.clone();
        if let Some(gate) = gate {
            gate.pass();
        }

        let state = self.state.lock().unwrap();
        if state.fail_sample {
            return Err(EchoError::BackendError("sampling failed".to_string()));
        }
        if self.cursor >= state.reply.len() {
            self.cursor = 0;
            if !state.never_eog {
                return Ok(EOG);
            }
        }
        let token = SCRIPT_BASE + self.cursor as TokenId;
        self.cursor += 1;
        Ok(token)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

pub struct MockEncoder {
    state: Shared,
}

impl ImageEncoder for MockEncoder {
    fn n_tokens(&self) -> usize {
        self.state.lock().unwrap().encoder_tokens
    }

    fn n_embd(&self) -> usize {
        self.state.lock().unwrap().encoder_embd
    }

    fn encode(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<f32>> {
        let state = self.state.lock().unwrap();
        if state.fail_encode {
            return Err(EchoError::BackendError("encoder failed".to_string()));
        }
        assert_eq!(rgb.len(), (width * height * 3) as usize);
        let mut len = state.encoder_tokens * state.encoder_embd;
        if state.encoder_short_output {
            len -= 1;
        }
        Ok(vec![0.25; len])
    }
}

/// A file that stands in for model weights
pub fn model_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"GGUF").unwrap();
    path
}

/// Runtime with a model loaded from a temp file
pub fn loaded_runtime() -> (Runtime, MockBackend, tempfile::TempDir) {
    let backend = MockBackend::new();
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::new(Arc::new(backend.clone()));
    runtime.load_model(model_file(&dir, "model.gguf"), &[]).unwrap();
    (runtime, backend, dir)
}

pub fn mock_encoder(backend: &MockBackend) -> Box<dyn ImageEncoder> {
    Box::new(MockEncoder {
        state: backend.state.clone(),
    })
}

/// Collect fragments and completions of a generate call
#[derive(Debug, Default)]
pub struct Collected {
    pub fragments: Vec<String>,
    pub completions: Vec<String>,
}

impl Collected {
    pub fn joined(&self) -> String {
        self.fragments.concat()
    }
}

/// Builds GGUF headers for metadata fixtures
pub struct GgufWriter {
    version: u32,
    entries: Vec<u8>,
    count: u64,
}

impl GgufWriter {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entries: Vec::new(),
            count: 0,
        }
    }

    fn len_field(&self, buf: &mut Vec<u8>, n: u64) {
        if self.version == 1 {
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        } else {
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }

    fn raw_string(&self, buf: &mut Vec<u8>, s: &str) {
        self.len_field(buf, s.len() as u64);
        buf.extend_from_slice(s.as_bytes());
    }

    /// Append a key with an arbitrary type tag and pre-encoded payload
    pub fn raw(mut self, key: &str, tag: u32, payload: &[u8]) -> Self {
        let mut buf = Vec::new();
        self.raw_string(&mut buf, key);
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(payload);
        self.entries.extend_from_slice(&buf);
        self.count += 1;
        self
    }

    pub fn u32(self, key: &str, value: u32) -> Self {
        self.raw(key, 4, &value.to_le_bytes())
    }

    pub fn string(self, key: &str, value: &str) -> Self {
        let mut payload = Vec::new();
        self.raw_string(&mut payload, value);
        self.raw(key, 8, &payload)
    }

    pub fn f32(self, key: &str, value: f32) -> Self {
        self.raw(key, 6, &value.to_le_bytes())
    }

    pub fn u32_array(self, key: &str, values: &[u32]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_le_bytes());
        self.len_field(&mut payload, values.len() as u64);
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.raw(key, 9, &payload)
    }

    pub fn string_array(self, key: &str, values: &[&str]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_le_bytes());
        self.len_field(&mut payload, values.len() as u64);
        for v in values {
            self.raw_string(&mut payload, v);
        }
        self.raw(key, 9, &payload)
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"GGUF");
        buf.extend_from_slice(&self.version.to_le_bytes());
        self.len_field(&mut buf, 0);
        self.len_field(&mut buf, self.count);
        buf.extend_from_slice(&self.entries);
        buf
    }

    pub fn write_to(&self, dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, self.bytes()).unwrap();
        path
    }
}
