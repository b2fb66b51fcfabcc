//! Audio decoding and resampling.
//!
//! Decodes a track to mono f32 PCM at the analysis sample rate. symphonia
//! handles the supported containers natively; an optional external ffmpeg
//! binary acts as a fallback for anything symphonia rejects. Decoding is
//! clipped at a fixed budget so a pathological input cannot exhaust
//! memory.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Error, Result};

/// Analysis sample rate fed to the feature extractor.
pub const SAMPLE_RATE: u32 = 22_050;

/// Decode budget; anything longer is clipped here.
const MAX_DECODE_SECS: usize = 12 * 60;

const RESAMPLE_CHUNK: usize = 1024;

/// Decode `path` to mono f32 PCM at `target_rate`. When a fallback decoder
/// is configured it is tried after a native failure.
pub fn load_mono(path: &Path, target_rate: u32, ffmpeg: Option<&str>) -> Result<Vec<f32>> {
    let native = decode_native(path, target_rate);
    match (native, ffmpeg) {
        (Ok(samples), _) => Ok(samples),
        (Err(detail), Some(bin)) => {
            log::debug!("native decode of {} failed ({detail}), trying {bin}", path.display());
            decode_external(bin, path, target_rate).map_err(|detail| Error::Decode {
                path: path.to_path_buf(),
                detail,
            })
        }
        (Err(detail), None) => Err(Error::Decode {
            path: path.to_path_buf(),
            detail,
        }),
    }
}

/// Verify that the configured external decoder can be executed at all.
/// A decoder that cannot run means the `--ffmpeg` value is wrong, so the
/// failure is a usage error.
pub fn probe_decoder(bin: &str) -> Result<()> {
    let status = Command::new(bin)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| Error::Usage(format!("external decoder '{bin}' is not runnable: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Usage(format!(
            "external decoder '{bin}' exited with {status}"
        )))
    }
}

fn decode_native(path: &Path, target_rate: u32) -> std::result::Result<Vec<f32>, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("failed to open file: {e}"))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| format!("failed to probe audio format: {e}"))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| "no audio track found".to_string())?;
    let track_id = track.id;
    let source_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| "audio track has no sample rate".to_string())?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| format!("failed to create decoder: {e}"))?;

    let budget = MAX_DECODE_SECS * source_rate as usize;
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(format!("error reading packet: {e}")),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("{}: decode warning: {e}", path.display());
                continue;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(format!("decode error: {e}")),
        };

        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        mix_interleaved(buf.samples(), spec.channels.count(), &mut samples);

        if samples.len() >= budget {
            log::warn!(
                "{}: decode budget of {MAX_DECODE_SECS}s reached, clipping",
                path.display()
            );
            samples.truncate(budget);
            break;
        }
    }

    if samples.is_empty() {
        return Err("decoded zero audio samples".to_string());
    }

    resample(samples, source_rate, target_rate)
}

/// Average interleaved frames down to one channel.
fn mix_interleaved(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    let scale = 1.0 / channels as f32;
    for frame in interleaved.chunks_exact(channels) {
        out.push(frame.iter().sum::<f32>() * scale);
    }
}

fn resample(
    samples: Vec<f32>,
    source_rate: u32,
    target_rate: u32,
) -> std::result::Result<Vec<f32>, String> {
    if source_rate == target_rate {
        return Ok(samples);
    }

    let mut resampler = FftFixedIn::<f32>::new(
        source_rate as usize,
        target_rate as usize,
        RESAMPLE_CHUNK,
        1,
        1,
    )
    .map_err(|e| format!("failed to create resampler: {e}"))?;

    let estimated = samples.len() as f64 * target_rate as f64 / source_rate as f64;
    let mut output = Vec::with_capacity(estimated as usize + RESAMPLE_CHUNK);
    let mut input = vec![vec![0.0f32; RESAMPLE_CHUNK]];

    let mut pos = 0;
    while pos + RESAMPLE_CHUNK <= samples.len() {
        input[0].copy_from_slice(&samples[pos..pos + RESAMPLE_CHUNK]);
        let waves = resampler
            .process(&input, None)
            .map_err(|e| format!("resampling error: {e}"))?;
        output.extend_from_slice(&waves[0]);
        pos += RESAMPLE_CHUNK;
    }
    if pos < samples.len() {
        // Final partial chunk, zero-padded to the fixed input size.
        input[0].fill(0.0);
        input[0][..samples.len() - pos].copy_from_slice(&samples[pos..]);
        let waves = resampler
            .process(&input, None)
            .map_err(|e| format!("resampling error: {e}"))?;
        output.extend_from_slice(&waves[0]);
    }

    Ok(output)
}

/// Decode through an external ffmpeg binary as raw f32le mono at the
/// target rate. stdout and stderr are drained on their own threads so a
/// chatty process cannot deadlock against a full pipe.
fn decode_external(
    bin: &str,
    path: &Path,
    target_rate: u32,
) -> std::result::Result<Vec<f32>, String> {
    let byte_budget = MAX_DECODE_SECS * target_rate as usize * 4;

    let mut child = Command::new(bin)
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(path)
        .args(["-f", "f32le", "-ac", "1", "-ar"])
        .arg(target_rate.to_string())
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start '{bin}': {e}"))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| "no stdout pipe from external decoder".to_string())?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| "no stderr pipe from external decoder".to_string())?;

    let stdout_handle = std::thread::spawn(move || {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let take = n.min(byte_budget.saturating_sub(bytes.len()));
                    bytes.extend_from_slice(&chunk[..take]);
                    if bytes.len() >= byte_budget {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        bytes
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text);
        text
    });

    let status = child
        .wait()
        .map_err(|e| format!("failed to wait for '{bin}': {e}"))?;
    let bytes = stdout_handle.join().unwrap_or_default();
    let errors = stderr_handle.join().unwrap_or_default();

    // A clipped read closes the pipe early; the decoder exiting non-zero
    // is then expected.
    if !status.success() && bytes.len() < byte_budget {
        let errors = errors.trim();
        return Err(if errors.is_empty() {
            format!("'{bin}' exited with {status}")
        } else {
            format!("'{bin}' failed: {errors}")
        });
    }

    let samples = f32le_samples(&bytes);
    if samples.is_empty() {
        return Err("external decoder produced no samples".to_string());
    }
    Ok(samples)
}

fn f32le_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
