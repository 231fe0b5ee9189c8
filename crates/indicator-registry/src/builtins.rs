//! Recurrence math for the built-in indicators.
//!
//! Every function here returns a series the same length as its input, with
//! NaN standing in for bars inside the indicator's warmup window. Callers
//! that need a compact series can drop leading NaNs themselves; the registry
//! never truncates so index `i` always refers to the same bar across every
//! indicator.

use crate::series::Bar;

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n {
        return out;
    }
    let mut window_sum = 0.0;
    for i in 0..n {
        window_sum += values[i];
        if i >= period {
            window_sum -= values[i - period];
        }
        if i + 1 >= period {
            out[i] = window_sum / period as f64;
        }
    }
    out
}

pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let mut prev = seed;
    for (i, value) in values.iter().enumerate().skip(period) {
        prev = value * k + prev * (1.0 - k);
        out[i] = prev;
    }
    out
}

pub struct RsiResult {
    pub rsi: Vec<f64>,
}

pub fn rsi(values: &[f64], period: usize) -> RsiResult {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n <= period {
        return RsiResult { rsi: out };
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta > 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in (period + 1)..n {
        let delta = values[i] - values[i - 1];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    RsiResult { rsi: out }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss.abs() < 1e-12 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}

pub struct MacdResult {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> MacdResult {
    let n = values.len();
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let macd_line: Vec<f64> = (0..n)
        .map(|i| {
            if fast_ema[i].is_finite() && slow_ema[i].is_finite() {
                fast_ema[i] - slow_ema[i]
            } else {
                f64::NAN
            }
        })
        .collect();

    let first_valid = macd_line.iter().position(|v| v.is_finite()).unwrap_or(n);
    let mut signal_line = vec![f64::NAN; n];
    if first_valid < n {
        let tail = &macd_line[first_valid..];
        let tail_signal = ema(tail, signal.min(tail.len().max(1)));
        for (offset, value) in tail_signal.into_iter().enumerate() {
            signal_line[first_valid + offset] = value;
        }
    }

    let histogram: Vec<f64> = (0..n)
        .map(|i| {
            if macd_line[i].is_finite() && signal_line[i].is_finite() {
                macd_line[i] - signal_line[i]
            } else {
                f64::NAN
            }
        })
        .collect();

    MacdResult {
        macd_line,
        signal_line,
        histogram,
    }
}

pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BollingerBands {
    let n = values.len();
    let middle = sma(values, period);
    let std = rolling_population_stddev(values, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    for i in 0..n {
        if middle[i].is_finite() && std[i].is_finite() {
            upper[i] = middle[i] + num_std * std[i];
            lower[i] = middle[i] - num_std * std[i];
        }
    }
    BollingerBands { upper, middle, lower }
}

pub fn stddev(values: &[f64], period: usize) -> Vec<f64> {
    rolling_population_stddev(values, period)
}

fn rolling_population_stddev(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n {
        return out;
    }
    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        out[i] = var.sqrt();
    }
    out
}

pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if n == 0 || period == 0 || n <= period {
        return out;
    }

    let true_range = |i: usize| -> f64 {
        if i == 0 {
            bars[i].high - bars[i].low
        } else {
            let a = bars[i].high - bars[i].low;
            let b = (bars[i].high - bars[i - 1].close).abs();
            let c = (bars[i].low - bars[i - 1].close).abs();
            a.max(b).max(c)
        }
    };

    let seed: f64 = (0..period).map(true_range).sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let mut prev = seed;
    for i in period..n {
        let tr = true_range(i);
        prev = (prev * (period as f64 - 1.0) + tr) / period as f64;
        out[i] = prev;
    }
    out
}

pub struct StochasticResult {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> StochasticResult {
    let n = bars.len();
    let mut k = vec![f64::NAN; n];
    if k_period > 0 && n >= k_period {
        for i in (k_period - 1)..n {
            let window = &bars[i + 1 - k_period..=i];
            let highest = window.iter().fold(f64::MIN, |acc, b| acc.max(b.high));
            let lowest = window.iter().fold(f64::MAX, |acc, b| acc.min(b.low));
            let range = highest - lowest;
            k[i] = if range.abs() < 1e-12 {
                50.0
            } else {
                (bars[i].close - lowest) / range * 100.0
            };
        }
    }
    let d = sma(&k, d_period);
    StochasticResult { k, d }
}

pub fn obv(bars: &[Bar]) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![0.0; n];
    for i in 1..n {
        out[i] = if bars[i].close > bars[i - 1].close {
            out[i - 1] + bars[i].volume
        } else if bars[i].close < bars[i - 1].close {
            out[i - 1] - bars[i].volume
        } else {
            out[i - 1]
        };
    }
    out
}
