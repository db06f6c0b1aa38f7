//! Strategy math over daily closes
//!
//! The exit target re-evaluates EMA9 against the live LTP, so every helper
//! takes a plain slice of closes and callers append the provisional bar
//! themselves via [`with_provisional`].

/// Exponential moving average with the standard span smoothing
/// (alpha = 2 / (span + 1)), seeded with the SMA of the first `span` closes.
///
/// Returns `None` when fewer than `span` closes are available.
pub fn ema(closes: &[f64], span: usize) -> Option<f64> {
    if span == 0 || closes.len() < span {
        return None;
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let seed: f64 = closes[..span].iter().sum::<f64>() / span as f64;
    let mut value = seed;
    for close in &closes[span..] {
        value = close * alpha + value * (1.0 - alpha);
    }
    Some(value)
}

/// Wilder RSI over the given period.
///
/// Seeds with simple averages of the first `period` gains/losses, then
/// applies Wilder smoothing across the rest of the series. Returns `None`
/// when fewer than `period + 1` closes are available. An all-gain window
/// returns 100.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for i in period + 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Closes with the live LTP appended as a provisional final bar
pub fn with_provisional(closes: &[f64], ltp: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(closes.len() + 1);
    out.extend_from_slice(closes);
    out.push(ltp);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let closes = vec![100.0; 50];
        let value = ema(&closes, 9).unwrap();
        assert!((value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ema_needs_span_bars() {
        assert!(ema(&[1.0, 2.0], 9).is_none());
    }

    #[test]
    fn ema_tracks_a_step_up() {
        // 20 bars at 100 then 10 bars at 110: EMA9 should sit between, near 110
        let mut closes = vec![100.0; 20];
        closes.extend(vec![110.0; 10]);
        let value = ema(&closes, 9).unwrap();
        assert!(value > 105.0 && value < 110.0, "got {}", value);
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert!((rsi(&closes, 10).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&closes, 10).unwrap() < 1e-9);
    }

    #[test]
    fn rsi_alternating_is_midscale() {
        let closes: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let value = rsi(&closes, 10).unwrap();
        assert!(value > 40.0 && value < 60.0, "got {}", value);
    }

    #[test]
    fn rsi_needs_period_plus_one() {
        assert!(rsi(&[1.0; 10], 10).is_none());
        assert!(rsi(&[1.0; 11], 10).is_some());
    }

    #[test]
    fn provisional_bar_moves_the_ema() {
        let closes = vec![100.0; 30];
        let flat = ema(&closes, 9).unwrap();
        let dipped = ema(&with_provisional(&closes, 90.0), 9).unwrap();
        assert!(dipped < flat);
    }
}
