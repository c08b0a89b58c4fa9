//! Sample-count window statistics over one device's ordered sequence.
//!
//! A trailing window ending at row `i` covers rows `i + 1 - window ..= i`. The
//! output is undefined until `window` samples exist or when any sample inside
//! the window is undefined.

use std::collections::VecDeque;

/// Running state of one statistic over the defined samples of a window.
trait WindowStat {
    /// Rebuild from scratch every `size` evictions to shed floating-point drift.
    const RESYNC: bool = false;

    fn insert(&mut self, value: f64);
    fn remove(&mut self, value: f64);
    fn clear(&mut self);
    fn value(&self) -> Option<f64>;
}

#[derive(Debug, Clone)]
struct TrailingWindow<S> {
    values: VecDeque<Option<f64>>,
    undefined: usize,
    size: usize,
    evictions: usize,
    stat: S,
}

impl<S: WindowStat> TrailingWindow<S> {
    fn new(size: usize, stat: S) -> Self {
        Self {
            values: VecDeque::with_capacity(size + 1),
            undefined: 0,
            size,
            evictions: 0,
            stat,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        match value {
            Some(v) => self.stat.insert(v),
            None => self.undefined += 1,
        }
        self.values.push_back(value);
        if self.values.len() > self.size {
            match self.values.pop_front() {
                Some(Some(old)) => self.stat.remove(old),
                Some(None) => self.undefined -= 1,
                None => {}
            }
            self.evictions += 1;
            if S::RESYNC && self.evictions >= self.size {
                self.evictions = 0;
                self.stat.clear();
                for v in self.values.iter().flatten() {
                    self.stat.insert(*v);
                }
            }
        }
    }

    fn current(&self) -> Option<f64> {
        if self.values.len() < self.size || self.undefined > 0 {
            return None;
        }
        self.stat.value()
    }
}

#[derive(Debug, Clone, Default)]
struct Moments {
    n: usize,
    sum: f64,
    sum_sq: f64,
    std: bool,
}

impl Moments {
    fn mean() -> Self {
        Self::default()
    }

    fn std_dev() -> Self {
        Self {
            std: true,
            ..Self::default()
        }
    }
}

impl WindowStat for Moments {
    const RESYNC: bool = true;

    fn insert(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn remove(&mut self, value: f64) {
        self.n -= 1;
        self.sum -= value;
        self.sum_sq -= value * value;
    }

    fn clear(&mut self) {
        self.n = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }

    fn value(&self) -> Option<f64> {
        let n = self.n as f64;
        if !self.std {
            return (self.n > 0).then(|| self.sum / n);
        }
        if self.n < 2 {
            return None;
        }
        let var = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        Some(var.max(0.0).sqrt())
    }
}

/// Candidates for the maximum in arrival order, non-increasing front to back.
#[derive(Debug, Clone, Default)]
struct MaxQueue(VecDeque<f64>);

impl WindowStat for MaxQueue {
    fn insert(&mut self, value: f64) {
        while self.0.back().is_some_and(|b| *b < value) {
            self.0.pop_back();
        }
        self.0.push_back(value);
    }

    fn remove(&mut self, value: f64) {
        if self.0.front() == Some(&value) {
            self.0.pop_front();
        }
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn value(&self) -> Option<f64> {
        self.0.front().copied()
    }
}

#[derive(Debug, Clone, Default)]
struct SortedSamples(Vec<f64>);

impl WindowStat for SortedSamples {
    fn insert(&mut self, value: f64) {
        let at = self.0.partition_point(|x| x.total_cmp(&value).is_lt());
        self.0.insert(at, value);
    }

    fn remove(&mut self, value: f64) {
        let at = self.0.partition_point(|x| x.total_cmp(&value).is_lt());
        if at < self.0.len() {
            self.0.remove(at);
        }
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn value(&self) -> Option<f64> {
        let n = self.0.len();
        match n {
            0 => None,
            _ if n % 2 == 0 => Some((self.0[n / 2 - 1] + self.0[n / 2]) / 2.0),
            _ => Some(self.0[n / 2]),
        }
    }
}

fn trailing<S: WindowStat>(values: &[Option<f64>], window: usize, stat: S) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }

    let mut state = TrailingWindow::new(window, stat);
    values
        .iter()
        .map(|v| {
            state.push(v.filter(|x| x.is_finite()));
            state.current()
        })
        .collect()
}

pub fn mean(window: &[f64]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

pub fn median(window: &[f64]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let mut sorted = window.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    } else {
        Some(sorted[n / 2])
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn std_dev(window: &[f64]) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }
    let m = mean(window)?;
    let var = window.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (window.len() - 1) as f64;
    Some(var.sqrt())
}

pub fn max(window: &[f64]) -> Option<f64> {
    window.iter().copied().reduce(f64::max)
}

pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    trailing(values, window, Moments::mean())
}

pub fn rolling_median(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    trailing(values, window, SortedSamples::default())
}

pub fn rolling_std(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    trailing(values, window, Moments::std_dev())
}

pub fn rolling_max(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    trailing(values, window, MaxQueue::default())
}

/// Maximum over the window that starts at each row and extends `window` rows
/// forward (`i ..= i + window - 1`). Rows without a full forward window are
/// undefined.
pub fn forward_max(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    // The trailing max ending at row i + window - 1 covers exactly i ..= i + window - 1.
    let trailing_max = rolling_max(values, window);
    (0..values.len())
        .map(|i| trailing_max.get(i + window - 1).copied().flatten())
        .collect()
}

/// Percent change against the previous sample, `(v / prev - 1) * 100`.
/// A zero or undefined predecessor yields undefined.
pub fn pct_change(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for (i, v) in values.iter().enumerate() {
        let change = match (i, prev, *v) {
            (0, _, _) => None,
            (_, Some(p), Some(c)) if p != 0.0 => Some((c / p - 1.0) * 100.0),
            _ => None,
        };
        out.push(change.filter(|x| x.is_finite()));
        prev = *v;
    }
    out
}
