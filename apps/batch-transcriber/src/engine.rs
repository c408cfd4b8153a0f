use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::config::ModelSize;

/// Whisper models expect 16 kHz mono f32 PCM.
const WHISPER_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
	pub start: f64,
	pub end: f64,
	pub text: String,
}

/// Full result for one file; also the JSON artifact schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcription {
	pub text: String,
	pub segments: Vec<Segment>,
	pub language: Option<String>,
	pub language_probability: Option<f32>,
	pub duration: f64,
	pub processing_time: f64,
	pub rtf: f64,
	pub model_size: String,
	pub device: String,
}

/// The inference boundary. The worker loop only sees this trait; tests feed
/// it stubs.
pub trait Transcriber {
	fn transcribe(&self, path: &Path, language: Option<&str>) -> Result<Transcription>;
}

/// whisper.cpp-backed engine. One instance per worker process; the model
/// stays resident for the process lifetime.
pub struct WhisperEngine {
	ctx: WhisperContext,
	threads: i32,
	model_size: String,
}

impl std::fmt::Debug for WhisperEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// WhisperContext has no Debug impl, so derive is unavailable
		f.debug_struct("WhisperEngine")
			.field("threads", &self.threads)
			.field("model_size", &self.model_size)
			.finish_non_exhaustive()
	}
}

impl WhisperEngine {
	/// Load the ggml model for `model_size` from `models_dir`.
	pub fn load(models_dir: &Path, model_size: ModelSize, threads: i32) -> Result<Self> {
		let model_path = models_dir.join(model_size.model_file());
		if !model_path.exists() {
			anyhow::bail!("Model file not found: {}", model_path.display());
		}

		info!("🔄 Loading Whisper model from {}...", model_path.display());
		let start = Instant::now();

		let path = model_path.to_str().context("Model path is not valid UTF-8")?;
		let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())?;

		let load_time = start.elapsed();
		info!(load_time_ms = load_time.as_millis(), threads, "✅ Whisper model loaded");

		Ok(Self {
			ctx,
			threads,
			model_size: model_size.to_string(),
		})
	}
}

impl Transcriber for WhisperEngine {
	fn transcribe(&self, path: &Path, language: Option<&str>) -> Result<Transcription> {
		let started = Instant::now();
		let samples = load_wav_mono(path)?;

		let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
		params.set_translate(false);
		params.set_print_special(false);
		params.set_print_progress(false);
		params.set_print_realtime(false);
		params.set_print_timestamps(false);
		params.set_n_threads(self.threads);
		// "auto" makes whisper.cpp run language detection
		params.set_language(Some(language.unwrap_or("auto")));

		let mut state = self.ctx.create_state().map_err(|e| anyhow::anyhow!("Failed to create Whisper state: {e}"))?;
		state.full(params, &samples).map_err(|e| anyhow::anyhow!("Transcription failed: {e}"))?;

		let num_segments = state.full_n_segments();
		let mut segments = Vec::new();
		let mut text = String::new();
		for i in 0..num_segments {
			if let Some(segment) = state.get_segment(i) {
				if let Ok(piece) = segment.to_str() {
					let trimmed = piece.trim();
					if !trimmed.is_empty() {
						if !text.is_empty() {
							text.push(' ');
						}
						text.push_str(trimmed);
					}
					segments.push(Segment {
						start: segment.start_timestamp() as f64 / 100.0,
						end: segment.end_timestamp() as f64 / 100.0,
						text: trimmed.to_string(),
					});
				}
			}
		}

		// Under auto-detect the artifact records what whisper settled on,
		// not the "auto" request
		let detected = if language.is_none() {
			whisper_rs::get_lang_str(state.full_lang_id_from_state())
		} else {
			None
		};

		let duration = transcribed_duration(&segments);
		let processing_time = started.elapsed().as_secs_f64();
		let rtf = if duration > 0.0 { processing_time / duration } else { 0.0 };

		Ok(Transcription {
			text,
			segments,
			language: recorded_language(language, detected),
			language_probability: None,
			duration,
			processing_time,
			rtf,
			model_size: self.model_size.clone(),
			device: if cfg!(feature = "cuda") { "cuda" } else { "cpu" }.to_string(),
		})
	}
}

fn load_wav_mono(path: &Path) -> Result<Vec<f32>> {
	let mut reader = hound::WavReader::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
	let spec = reader.spec();

	if spec.sample_rate != WHISPER_SAMPLE_RATE {
		anyhow::bail!("Expected {WHISPER_SAMPLE_RATE} Hz audio, got {} Hz (resample the file first)", spec.sample_rate);
	}

	let samples: Vec<f32> = match spec.sample_format {
		hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
		hound::SampleFormat::Int => match spec.bits_per_sample {
			16 => reader
				.samples::<i16>()
				.map(|s| s.map(|v| f32::from(v) / 32768.0))
				.collect::<std::result::Result<_, _>>()?,
			32 => reader
				.samples::<i32>()
				.map(|s| s.map(|v| v as f32 / 2_147_483_648.0))
				.collect::<std::result::Result<_, _>>()?,
			bits => anyhow::bail!("Unsupported bit depth: {bits}"),
		},
	};

	match spec.channels {
		1 => Ok(samples),
		2 => Ok(downmix_stereo(&samples)),
		channels => anyhow::bail!("Unsupported channel count: {channels}"),
	}
}

fn downmix_stereo(samples: &[f32]) -> Vec<f32> {
	samples.chunks_exact(2).map(|pair| (pair[0] + pair[1]) / 2.0).collect()
}

/// Audio accounting uses transcribed time (last segment end), not container
/// length; silence past the last word does not count.
fn transcribed_duration(segments: &[Segment]) -> f64 {
	segments.last().map_or(0.0, |s| s.end)
}

/// A forced language wins; detection only fills the gap on auto runs.
fn recorded_language(requested: Option<&str>, detected: Option<&str>) -> Option<String> {
	requested.or(detected).map(str::to_string)
}

/// Write the two artifacts for one file under `output_dir/<stem>/`:
/// `<stem>.json` (full result, pretty-printed) and `<stem>.txt` (transcript
/// only). Returns the per-file directory.
pub fn save_artifacts(output_dir: &Path, audio_path: &Path, transcription: &Transcription) -> Result<PathBuf> {
	let stem = audio_path
		.file_stem()
		.map_or_else(|| "output".to_string(), |s| s.to_string_lossy().into_owned());
	let file_dir = output_dir.join(&stem);
	fs::create_dir_all(&file_dir).with_context(|| format!("Failed to create {}", file_dir.display()))?;

	let json = serde_json::to_string_pretty(transcription)?;
	fs::write(file_dir.join(format!("{stem}.json")), json)?;
	fs::write(file_dir.join(format!("{stem}.txt")), &transcription.text)?;

	Ok(file_dir)
}
