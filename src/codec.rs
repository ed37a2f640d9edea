//! Codec engine loading and the opus → mp3 conversion job
//!
//! The engine itself is opaque: a `CodecProvider` produces a `CodecEngine`
//! that turns input bytes into MP3 bytes. This module owns the load state
//! and the job around it (naming, progress, user-facing errors).

use crate::error::{ProxyError, Result};
use crate::models::SharedFile;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Audio encoder requested from the engine
pub const OUTPUT_CODEC: &str = "libmp3lame";

/// Target bitrate of the MP3 output
pub const OUTPUT_BITRATE: &str = "192k";

pub const OUTPUT_EXTENSION: &str = ".mp3";

pub const OUTPUT_MIME: &str = "audio/mpeg";

/// Extension assumed for inputs whose name has none
const DEFAULT_INPUT_EXTENSION: &str = ".opus";

/// Shown when the engine could not be loaded
pub const LOAD_FAILED_MESSAGE: &str =
    "Failed to load the converter. Check your internet connection and try again.";

/// One transcode request handed to the engine
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Scratch name of the input, e.g. `input.ogg`
    pub input_name: String,
    pub output_name: String,
    pub input: Bytes,
    pub codec: &'static str,
    pub bitrate: &'static str,
}

/// A loaded codec engine
#[async_trait]
pub trait CodecEngine: Send + Sync {
    /// Transcode `job.input`, reporting progress as a fraction in `[0, 1]`
    async fn transcode(
        &self,
        job: TranscodeJob,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<Bytes>;
}

/// Loads the codec engine (downloading it, in practice)
#[async_trait]
pub trait CodecProvider: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn CodecEngine>>;
}

type LoadFuture = Shared<BoxFuture<'static, std::result::Result<Arc<dyn CodecEngine>, ProxyError>>>;

enum LoadState {
    Unloaded,
    Loading(LoadFuture),
    Ready(Arc<dyn CodecEngine>),
}

/// Observable load state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Unloaded,
    Loading,
    Ready,
}

/// Single-flight loader for the codec engine
///
/// Concurrent `load` calls share one in-flight load. A failed load leaves
/// the loader `Unloaded` so the next call retries.
pub struct CodecLoader {
    provider: Arc<dyn CodecProvider>,
    state: Mutex<LoadState>,
}

impl CodecLoader {
    pub fn new(provider: Arc<dyn CodecProvider>) -> Self {
        CodecLoader {
            provider,
            state: Mutex::new(LoadState::Unloaded),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LoadState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> LoadStatus {
        match &*self.lock_state() {
            LoadState::Unloaded => LoadStatus::Unloaded,
            LoadState::Loading(_) => LoadStatus::Loading,
            LoadState::Ready(_) => LoadStatus::Ready,
        }
    }

    /// Return the engine, loading it if needed
    pub async fn load(&self) -> Result<Arc<dyn CodecEngine>> {
        let pending = {
            let mut state = self.lock_state();
            match &*state {
                LoadState::Ready(engine) => return Ok(engine.clone()),
                LoadState::Loading(pending) => {
                    debug!("Codec load already in flight, waiting");
                    pending.clone()
                }
                LoadState::Unloaded => {
                    info!("Loading codec engine");
                    let provider = self.provider.clone();
                    let pending = async move { provider.load().await }.boxed().shared();
                    *state = LoadState::Loading(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        // An unload (or a newer load) may have replaced the state meanwhile
        let mut state = self.lock_state();
        if let LoadState::Loading(current) = &*state {
            if current.ptr_eq(&pending) {
                *state = match &result {
                    Ok(engine) => LoadState::Ready(engine.clone()),
                    Err(e) => {
                        warn!("Codec engine failed to load: {}", e);
                        LoadState::Unloaded
                    }
                };
            }
        }
        result
    }

    /// Drop the engine; the next `load` starts over
    pub fn unload(&self) {
        *self.lock_state() = LoadState::Unloaded;
        debug!("Codec engine unloaded");
    }
}

/// Conversion stage reported through progress updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Converting,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    /// 0..=100
    pub percentage: u8,
    pub message: String,
}

impl Progress {
    fn new(stage: Stage, percentage: u8, message: &str) -> Self {
        Progress {
            stage,
            percentage: percentage.min(100),
            message: message.to_string(),
        }
    }
}

/// Outcome of one conversion
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub output: Option<Bytes>,
    pub output_file_name: String,
    /// User-facing error text; never carries internal details
    pub error: Option<String>,
    pub duration: Duration,
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }
}

/// `name` with its extension replaced by `.mp3` (appended when it has none)
pub fn output_file_name(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => format!("{}{}", &name[..idx], OUTPUT_EXTENSION),
        None => format!("{}{}", name, OUTPUT_EXTENSION),
    }
}

fn input_extension(file: &SharedFile) -> String {
    file.extension()
        .unwrap_or_else(|| DEFAULT_INPUT_EXTENSION.to_string())
}

/// Runs conversions on the lazily loaded engine
pub struct Converter {
    loader: Arc<CodecLoader>,
}

impl Converter {
    pub fn new(loader: Arc<CodecLoader>) -> Self {
        Converter { loader }
    }

    pub fn loader(&self) -> &Arc<CodecLoader> {
        &self.loader
    }

    /// Convert `file` to MP3, reporting progress through `on_progress`
    pub async fn convert<F>(&self, file: &SharedFile, on_progress: F) -> ConversionResult
    where
        F: Fn(Progress) + Send + Sync,
    {
        let start = Instant::now();
        let output_file_name = output_file_name(&file.name);

        let result = self.run(file, &on_progress).await;
        let duration = start.elapsed();

        match result {
            Ok(output) => {
                info!(
                    "Conversion complete: input={}, output={}, size={}, duration_ms={}",
                    file.name,
                    output_file_name,
                    output.len(),
                    duration.as_millis()
                );
                ConversionResult {
                    output: Some(output),
                    output_file_name,
                    error: None,
                    duration,
                }
            }
            Err(message) => ConversionResult {
                output: None,
                output_file_name,
                error: Some(message),
                duration,
            },
        }
    }

    async fn run<F>(&self, file: &SharedFile, on_progress: &F) -> std::result::Result<Bytes, String>
    where
        F: Fn(Progress) + Send + Sync,
    {
        let cold = self.loader.status() != LoadStatus::Ready;
        if cold {
            on_progress(Progress::new(Stage::Loading, 0, "Loading converter..."));
        }
        let engine = self.loader.load().await.map_err(|e| {
            warn!("Converter unavailable: {}", e);
            LOAD_FAILED_MESSAGE.to_string()
        })?;
        if cold {
            on_progress(Progress::new(Stage::Loading, 100, "Converter ready!"));
        }

        on_progress(Progress::new(Stage::Converting, 0, "Preparing file..."));
        let job = TranscodeJob {
            input_name: format!("input{}", input_extension(file)),
            output_name: format!("output{}", OUTPUT_EXTENSION),
            input: file.bytes.clone(),
            codec: OUTPUT_CODEC,
            bitrate: OUTPUT_BITRATE,
        };
        on_progress(Progress::new(Stage::Converting, 5, "Starting conversion..."));

        let report = |fraction: f32| {
            let percentage = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
            on_progress(Progress::new(Stage::Converting, percentage, "Converting audio..."));
        };
        let output = engine.transcode(job, &report).await.map_err(|e| {
            warn!("Transcode failed for {}: {}", file.name, e);
            e.user_message().to_string()
        })?;

        on_progress(Progress::new(Stage::Finalizing, 95, "Finalizing..."));
        on_progress(Progress::new(Stage::Finalizing, 100, "Conversion complete!"));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoEngine;

    #[async_trait]
    impl CodecEngine for EchoEngine {
        async fn transcode(
            &self,
            job: TranscodeJob,
            progress: &(dyn Fn(f32) + Send + Sync),
        ) -> Result<Bytes> {
            assert_eq!(job.codec, "libmp3lame");
            assert_eq!(job.bitrate, "192k");
            progress(0.5);
            let mut out = job.input_name.into_bytes();
            out.extend_from_slice(&job.input);
            Ok(Bytes::from(out))
        }
    }

    struct CountingProvider {
        loads: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl CodecProvider for CountingProvider {
        async fn load(&self) -> Result<Arc<dyn CodecEngine>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && n == 0 {
                return Err(ProxyError::NetworkError("unpkg unreachable".to_string()));
            }
            Ok(Arc::new(EchoEngine))
        }
    }

    fn provider(fail_first: bool) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            loads: AtomicUsize::new(0),
            fail_first,
        })
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("voice.opus"), "voice.mp3");
        assert_eq!(output_file_name("my.song.ogg"), "my.song.mp3");
        assert_eq!(output_file_name("recording"), "recording.mp3");
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_flight() {
        let provider = provider(false);
        let loader = Arc::new(CodecLoader::new(provider.clone()));

        let (a, b) = tokio::join!(loader.load(), loader.load());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.status(), LoadStatus::Ready);
    }

    #[tokio::test]
    async fn test_failed_load_can_retry() {
        let provider = provider(true);
        let loader = CodecLoader::new(provider.clone());

        assert!(loader.load().await.is_err());
        assert_eq!(loader.status(), LoadStatus::Unloaded);
        assert!(loader.load().await.is_ok());
        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unload_resets() {
        let provider = provider(false);
        let loader = CodecLoader::new(provider.clone());
        loader.load().await.unwrap();
        loader.unload();
        assert_eq!(loader.status(), LoadStatus::Unloaded);
        loader.load().await.unwrap();
        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_convert_reports_stages() {
        let converter = Converter::new(Arc::new(CodecLoader::new(provider(false))));
        let seen = Mutex::new(Vec::new());
        let file = SharedFile::new("Clip.OGG", "audio/ogg", Bytes::from_static(b"data"));

        let result = converter
            .convert(&file, |p| seen.lock().unwrap().push((p.stage, p.percentage)))
            .await;

        assert!(result.is_success());
        assert_eq!(result.output_file_name, "Clip.mp3");
        assert_eq!(&result.output.unwrap()[..], b"input.oggdata");

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&(Stage::Loading, 0)));
        assert!(seen.contains(&(Stage::Converting, 50)));
        assert_eq!(seen.last(), Some(&(Stage::Finalizing, 100)));
    }

    #[tokio::test]
    async fn test_convert_load_failure_is_user_facing() {
        let converter = Converter::new(Arc::new(CodecLoader::new(provider(true))));
        let file = SharedFile::new("a", "", Bytes::new());

        let result = converter.convert(&file, |_| {}).await;
        assert!(!result.is_success());
        assert_eq!(result.output_file_name, "a.mp3");
        assert_eq!(result.error.as_deref(), Some(LOAD_FAILED_MESSAGE));
    }
}
