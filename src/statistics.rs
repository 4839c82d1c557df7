use serde::Serialize;

/// Running min/max/mean/variance of decay intervals in integer nanoseconds.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct State {
    x0: i32,
    count: u32,
    min: i32,
    max: i32,
    m1: i64,
    // Data is taken relative to the first sample to extend the dynamic
    // range of the naive variance. `m2` overflows if
    // `sum((x-x0)**2) > u64::MAX`.
    m2: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            x0: 0,
            count: 0,
            max: i32::MIN,
            min: i32::MAX,
            m1: 0,
            m2: 0,
        }
    }
}

impl State {
    pub fn update(&mut self, x: i32) {
        if self.count == 0 {
            self.x0 = x;
        }
        let x64 = (x - self.x0) as i64;
        self.count += 1;
        self.m1 += x64;
        self.m2 += (x64 * x64) as u64;
        self.max = self.max.max(x);
        self.min = self.min.min(x);
    }

    /// Add a decay interval given in seconds.
    pub fn update_seconds(&mut self, t: f64) {
        self.update((t * 1e9).round() as i32);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Statistics multiplied by `scale`, e.g. `1e-3` for microseconds.
    pub fn get_scaled(&self, scale: f32) -> ScaledStatistics {
        let mut stat = ScaledStatistics::default();
        if self.count != 0 {
            let c = 1. / self.count as f64;
            let mean = self.m1 as f64 * c;
            let var = self.m2 as f64 * c - mean * mean;
            stat = ScaledStatistics {
                count: self.count,
                min: self.min as f32 * scale,
                max: self.max as f32 * scale,
                mean: (mean as f32 + self.x0 as f32) * scale,
                std: (var.max(0.) as f32).sqrt() * scale,
            };
        }
        stat
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Default, Serialize)]
pub struct ScaledStatistics {
    pub count: u32,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

/// Number of decay histogram bins.
pub const DECAY_BINS: usize = 32;

/// Decay intervals binned uniformly over the measurement window.
#[derive(Copy, Clone, PartialEq, Debug, Serialize)]
pub struct DecayHistogram {
    /// Bin width in microseconds.
    pub bin_width: f32,
    pub counts: [u32; DECAY_BINS],
    /// Intervals beyond the last bin.
    pub overflow: u32,
    #[serde(skip)]
    width: f64,
}

impl DecayHistogram {
    /// Bins spanning `0..window` seconds.
    pub fn new(window: f64) -> Self {
        let width = window / DECAY_BINS as f64;
        Self {
            bin_width: (width * 1e6) as f32,
            counts: [0; DECAY_BINS],
            overflow: 0,
            width,
        }
    }

    /// Add a decay interval given in seconds.
    pub fn record(&mut self, t: f64) {
        let bin = if self.width > 0. {
            (t.max(0.) / self.width) as usize
        } else {
            DECAY_BINS
        };
        match self.counts.get_mut(bin) {
            Some(count) => *count += 1,
            None => self.overflow += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum::<u32>() + self.overflow
    }
}
