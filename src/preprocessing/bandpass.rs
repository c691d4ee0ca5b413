// src/preprocessing/bandpass.rs

// Biquad section, 2nd order. Coefficients follow the audio EQ cookbook.
#[derive(Debug, Clone)]
pub struct Biquad {
    a: [f64; 3],
    b: [f64; 3],
    x: [f64; 2],
    y: [f64; 2],
}

impl Biquad {
    fn from_coefficients(a: [f64; 3], b: [f64; 3]) -> Self {
        Biquad {
            a,
            b,
            x: [0.0, 0.0],
            y: [0.0, 0.0],
        }
    }

    // Butterworth Q for a maximally flat passband.
    fn butterworth_q() -> f64 {
        (2.0f64).sqrt() / 2.0
    }

    pub fn highpass(f0: f64, fs: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * f0 / fs;
        let alpha = f64::sin(omega) / (2.0 * Self::butterworth_q());
        let cos = f64::cos(omega);

        let b0 = (1.0 + cos) / 2.0;
        let b1 = -(1.0 + cos);
        let b2 = (1.0 + cos) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos;
        let a2 = 1.0 - alpha;

        Self::from_coefficients([a0, a1, a2], [b0, b1, b2])
    }

    pub fn lowpass(f0: f64, fs: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * f0 / fs;
        let alpha = f64::sin(omega) / (2.0 * Self::butterworth_q());
        let cos = f64::cos(omega);

        let b0 = (1.0 - cos) / 2.0;
        let b1 = 1.0 - cos;
        let b2 = (1.0 - cos) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos;
        let a2 = 1.0 - alpha;

        Self::from_coefficients([a0, a1, a2], [b0, b1, b2])
    }

    // Filter an input sample and update the internal state
    pub fn filter(&mut self, input: f64) -> f64 {
        let output = (self.b[0] / self.a[0]) * input
            + (self.b[1] / self.a[0]) * self.x[0]
            + (self.b[2] / self.a[0]) * self.x[1]
            - (self.a[1] / self.a[0]) * self.y[0]
            - (self.a[2] / self.a[0]) * self.y[1];

        self.x[1] = self.x[0];
        self.x[0] = input;
        self.y[1] = self.y[0];
        self.y[0] = output;

        output
    }
}

/// High-pass at `freq_min` followed by low-pass at `freq_max`.
#[derive(Debug, Clone)]
pub struct BandPassFilter {
    high: Biquad,
    low: Biquad,
}

impl BandPassFilter {
    pub fn new(freq_min: f64, freq_max: f64, fs: f64) -> Self {
        BandPassFilter {
            high: Biquad::highpass(freq_min, fs),
            low: Biquad::lowpass(freq_max, fs),
        }
    }

    pub fn filter(&mut self, input: f64) -> f64 {
        let high = self.high.filter(input);
        self.low.filter(high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms_after_settling(filter: &mut BandPassFilter, freq: f64, fs: f64) -> f64 {
        let n = fs as usize;
        let out: Vec<f64> = (0..n)
            .map(|i| filter.filter((2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin()))
            .collect();
        let tail = &out[n / 2..];
        (tail.iter().map(|v| v * v).sum::<f64>() / tail.len() as f64).sqrt()
    }

    #[test]
    fn passes_band_and_rejects_dc() {
        let fs = 20000.0;
        let mut dc = BandPassFilter::new(300.0, 6000.0, fs);
        let settled = (0..20000).map(|_| dc.filter(1.0)).last().unwrap();
        assert!(settled.abs() < 1e-3);

        let in_band = rms_after_settling(&mut BandPassFilter::new(300.0, 6000.0, fs), 1500.0, fs);
        let below = rms_after_settling(&mut BandPassFilter::new(300.0, 6000.0, fs), 20.0, fs);
        assert!(in_band > 0.6);
        assert!(below < 0.05);
    }
}
