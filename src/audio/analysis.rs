use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Window length for the frequency analysis. Visualization polls every frame,
/// so the window covers the most recent ~43 ms of audio at 24 kHz.
pub const FFT_SIZE: usize = 1024;

/// Number of amplitude bins returned by [`Analyzer::magnitudes`].
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Logical analysis channels exposed to visualization. Speech tracks land on
/// `voice`, background tracks on `music`, and `frequency` sees everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisChannel {
    Voice,
    Music,
    Frequency,
}

/// Fixed-size circular window over the most recent samples of one channel.
struct RingWindow {
    samples: [f32; FFT_SIZE],
    write: usize,
}

impl RingWindow {
    fn new() -> Self {
        Self {
            samples: [0.0; FFT_SIZE],
            write: 0,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.samples[self.write] = s;
            self.write = (self.write + 1) % FFT_SIZE;
        }
    }

    /// Copies the window out in chronological order.
    fn snapshot(&self) -> [f32; FFT_SIZE] {
        let mut out = [0.0; FFT_SIZE];
        let (tail, head) = self.samples.split_at(self.write);
        out[..head.len()].copy_from_slice(head);
        out[head.len()..].copy_from_slice(tail);
        out
    }
}

/// Rolling spectral analyzer fed from the playback path.
pub struct Analyzer {
    voice: RingWindow,
    music: RingWindow,
    combined: RingWindow,
    fft: Arc<dyn Fft<f32>>,
    hann: [f32; FFT_SIZE],
}

impl Analyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let mut hann = [0.0f32; FFT_SIZE];
        for (i, w) in hann.iter_mut().enumerate() {
            *w = 0.5
                * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE - 1) as f32).cos());
        }
        Self {
            voice: RingWindow::new(),
            music: RingWindow::new(),
            combined: RingWindow::new(),
            fft: planner.plan_fft_forward(FFT_SIZE),
            hann,
        }
    }

    /// Feeds decoded samples for one track. Track ids prefixed with `music`
    /// land on the music channel; everything else is treated as voice.
    pub fn push(&mut self, track_id: &str, samples: &[f32]) {
        if track_id.starts_with("music") {
            self.music.push(samples);
        } else {
            self.voice.push(samples);
        }
        self.combined.push(samples);
    }

    /// Amplitude per frequency bin for the requested channel, normalized to
    /// roughly 0.0..=1.0. Always `BIN_COUNT` values.
    pub fn magnitudes(&self, channel: AnalysisChannel) -> Vec<f32> {
        let window = match channel {
            AnalysisChannel::Voice => self.voice.snapshot(),
            AnalysisChannel::Music => self.music.snapshot(),
            AnalysisChannel::Frequency => self.combined.snapshot(),
        };

        let mut buffer: Vec<Complex<f32>> = window
            .iter()
            .zip(self.hann.iter())
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        buffer[..BIN_COUNT]
            .iter()
            .map(|c| c.norm() * 2.0 / FFT_SIZE as f32)
            .collect()
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SAMPLE_RATE;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn detects_tone_in_expected_bin() {
        let mut analyzer = Analyzer::new();
        // 1875 Hz falls exactly on bin 80 (24000 / 1024 * 80).
        analyzer.push("item_1", &sine(1875.0, FFT_SIZE));

        let bins = analyzer.magnitudes(AnalysisChannel::Voice);
        assert_eq!(bins.len(), BIN_COUNT);
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 80);
    }

    #[test]
    fn music_tracks_do_not_leak_into_voice() {
        let mut analyzer = Analyzer::new();
        analyzer.push("music_bed", &sine(1875.0, FFT_SIZE));

        let voice = analyzer.magnitudes(AnalysisChannel::Voice);
        assert!(voice.iter().all(|m| *m < 1e-3));

        let music = analyzer.magnitudes(AnalysisChannel::Music);
        assert!(music[80] > 0.1);
        let combined = analyzer.magnitudes(AnalysisChannel::Frequency);
        assert!(combined[80] > 0.1);
    }

    #[test]
    fn silent_window_is_all_zero() {
        let analyzer = Analyzer::new();
        let bins = analyzer.magnitudes(AnalysisChannel::Frequency);
        assert!(bins.iter().all(|m| *m < 1e-6));
    }
}
