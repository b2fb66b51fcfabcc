//! Mel-spectrogram slice extraction.
//!
//! Turns mono PCM into the embedding model's input tensor: Hann-windowed
//! STFT with centre padding, power spectrum, triangular mel filterbank,
//! then the frame axis is cut into fixed-width slices. Each slice is
//! converted to log magnitudes (power-to-dB) and min-max normalised to
//! [0, 1] on its own, matching how the model was trained.

use ndarray::Array4;
use rustfft::{num_complex::Complex, FftPlanner};

pub const N_FFT: usize = 2048;
pub const HOP_LENGTH: usize = 512;

/// power_to_db floor, matching librosa's `amin`.
const AMIN: f32 = 1e-10;
/// Dynamic range kept below the per-slice peak, in dB.
const TOP_DB: f32 = 80.0;

/// Build the model input tensor `(slices, 1, n_mels, slice_size)` from
/// mono PCM. Returns `None` when the signal is shorter than one slice or
/// yields no complete slice.
pub fn slice_tensor(
    samples: &[f32],
    sample_rate: u32,
    n_mels: usize,
    slice_size: usize,
) -> Option<Array4<f32>> {
    if samples.len() < slice_size {
        return None;
    }

    // frames x mels, power scale
    let spectrogram = mel_spectrogram(samples, sample_rate, n_mels);
    let n_slices = spectrogram.len() / slice_size;
    if n_slices == 0 {
        return None;
    }

    let mut tensor = Array4::<f32>::zeros((n_slices, 1, n_mels, slice_size));
    let mut block = vec![0.0f32; n_mels * slice_size];
    for slice in 0..n_slices {
        let frames = &spectrogram[slice * slice_size..(slice + 1) * slice_size];
        for (t, frame) in frames.iter().enumerate() {
            for (m, &power) in frame.iter().enumerate() {
                block[m * slice_size + t] = power;
            }
        }
        power_to_db(&mut block);

        let max = block.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min = block.iter().cloned().fold(f32::INFINITY, f32::min);
        if max > min {
            let denom = max - min;
            for m in 0..n_mels {
                for t in 0..slice_size {
                    tensor[[slice, 0, m, t]] = (block[m * slice_size + t] - min) / denom;
                }
            }
        }
        // max == min: the slice stays zero.
    }
    Some(tensor)
}

/// In-place power-to-dB with the usual floor and top-dB clamp.
fn power_to_db(values: &mut [f32]) {
    for v in values.iter_mut() {
        *v = 10.0 * v.max(AMIN).log10();
    }
    let peak = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let floor = peak - TOP_DB;
    for v in values.iter_mut() {
        *v = v.max(floor);
    }
}

/// Mel power spectrogram, frames-major: `out[frame][mel]`.
fn mel_spectrogram(samples: &[f32], sample_rate: u32, n_mels: usize) -> Vec<Vec<f32>> {
    // centre padding, constant (zero) mode
    let mut padded = vec![0.0f32; samples.len() + N_FFT];
    padded[N_FFT / 2..N_FFT / 2 + samples.len()].copy_from_slice(samples);

    let n_frames = (padded.len() - N_FFT) / HOP_LENGTH + 1;
    let n_bins = N_FFT / 2 + 1;
    let window = hann_window(N_FFT);
    let filters = mel_filterbank(sample_rate as usize, N_FFT, n_mels);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(N_FFT);
    let mut buffer = vec![Complex { re: 0.0f32, im: 0.0f32 }; N_FFT];
    let mut power = vec![0.0f32; n_bins];

    let mut out = Vec::with_capacity(n_frames);
    for frame in 0..n_frames {
        let start = frame * HOP_LENGTH;
        for (i, (&s, &w)) in padded[start..start + N_FFT].iter().zip(&window).enumerate() {
            buffer[i] = Complex { re: s * w, im: 0.0 };
        }
        fft.process(&mut buffer);
        for (p, c) in power.iter_mut().zip(&buffer[..n_bins]) {
            *p = c.re * c.re + c.im * c.im;
        }

        let mut mel = vec![0.0f32; n_mels];
        for (m, filter) in filters.iter().enumerate() {
            mel[m] = filter.iter().zip(&power).map(|(f, p)| f * p).sum();
        }
        out.push(mel);
    }
    out
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos()))
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank over `n_fft / 2 + 1` bins, spanning 0 Hz to
/// the Nyquist frequency.
fn mel_filterbank(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let f_min = 0.0f32;
    let f_max = sample_rate as f32 / 2.0;
    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);

    let bin_points: Vec<usize> = (0..n_mels + 2)
        .map(|i| {
            let mel = mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32;
            let hz = mel_to_hz(mel);
            ((n_fft as f32 + 1.0) * hz / sample_rate as f32).floor() as usize
        })
        .collect();

    let n_bins = n_fft / 2 + 1;
    let mut filters = vec![vec![0.0f32; n_bins]; n_mels];
    for m in 0..n_mels {
        let (left, center, right) = (bin_points[m], bin_points[m + 1], bin_points[m + 2]);
        for k in left..center.min(n_bins) {
            filters[m][k] = (k - left) as f32 / (center - left) as f32;
        }
        for k in center..right.min(n_bins) {
            filters[m][k] = (right - k) as f32 / (right - center) as f32;
        }
    }
    filters
}
