//! Position sizing and volume arithmetic shared by the dispatcher and the
//! execution engine.

use crate::constants::dispatch::{PIP_PRECISION, STEP_EPSILON};

/// Risk-based lot computation result.
#[derive(Clone, Debug, PartialEq)]
pub struct LotSizing {
    pub lot: f64,
    pub risk_amount: f64,
    pub pip_distance: f64,
}

/// `|entry - stop_loss|` in pips, with float noise below 1e-6 pip removed.
pub fn pip_distance(entry: f64, stop_loss: f64, pip_size: f64) -> f64 {
    if pip_size <= 0.0 {
        return 0.0;
    }
    let raw = (entry - stop_loss).abs() / pip_size;
    (raw / PIP_PRECISION).round() * PIP_PRECISION
}

/// Largest multiple of `step` not above `value`.
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = ((value + STEP_EPSILON) / step).floor();
    round_to_step_precision(steps * step, step)
}

fn round_to_step_precision(value: f64, step: f64) -> f64 {
    let decimals = step_decimals(step);
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn step_decimals(step: f64) -> u32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 8 && (scaled - scaled.round()).abs() > STEP_EPSILON {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Round a price to the instrument's quote precision.
pub fn round_price(price: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (price * factor).round() / factor
}

/// `lot = (balance * risk% / 100) / (pip_distance * pip_value)`, clamped to
/// `[min_lot, max_lot]` and then rounded down to the volume step. Returns
/// None when the inputs cannot produce a size (non-positive distance or pip
/// value).
pub fn compute_lot_size(
    account_balance: f64,
    risk_percent: f64,
    pip_distance: f64,
    pip_value_per_lot: f64,
    min_lot: f64,
    max_lot: f64,
    volume_step: f64,
) -> Option<LotSizing> {
    if pip_distance <= 0.0 || pip_value_per_lot <= 0.0 || account_balance <= 0.0 {
        return None;
    }

    let risk_amount = account_balance * risk_percent / 100.0;
    let raw_lot = risk_amount / (pip_distance * pip_value_per_lot);
    let clamped = raw_lot.clamp(min_lot, max_lot);
    let stepped = round_down_to_step(clamped, volume_step);

    Some(LotSizing {
        lot: clamp_lot(stepped, min_lot, max_lot),
        risk_amount,
        pip_distance,
    })
}

/// Final guard so rounding can never leave the configured bounds.
pub fn clamp_lot(lot: f64, min_lot: f64, max_lot: f64) -> f64 {
    lot.max(min_lot).min(max_lot)
}

/// Split `total` across `parts` sub-positions on the volume step. The last
/// part takes the remainder. None if any part would fall below `volume_min`.
pub fn split_volume(total: f64, parts: usize, volume_step: f64, volume_min: f64) -> Option<Vec<f64>> {
    if parts == 0 {
        return None;
    }
    if parts == 1 {
        return Some(vec![total]);
    }
    let each = round_down_to_step(total / parts as f64, volume_step);
    if each + STEP_EPSILON < volume_min {
        return None;
    }
    let mut volumes = vec![each; parts - 1];
    let last = round_to_step_precision(total - each * (parts - 1) as f64, volume_step);
    if last + STEP_EPSILON < volume_min {
        return None;
    }
    volumes.push(last);
    Some(volumes)
}

/// Volume to close for a partial close of `percent` of `volume`, rounded down
/// to the step. Errors when the closed part or a non-zero remainder would be
/// below the instrument minimum.
pub fn partial_close_volume(volume: f64, percent: f64, volume_step: f64, volume_min: f64) -> Result<f64, String> {
    if !(percent > 0.0 && percent <= 100.0) {
        return Err(format!("percent {} outside (0, 100]", percent));
    }
    let to_close = round_down_to_step(volume * percent / 100.0, volume_step);
    if to_close + STEP_EPSILON < volume_min {
        return Err(format!(
            "close volume {:.2} below minimum {:.2}",
            to_close, volume_min
        ));
    }
    let remainder = volume - to_close;
    if remainder > STEP_EPSILON && remainder + STEP_EPSILON < volume_min {
        return Err(format!(
            "remaining volume {:.2} below minimum {:.2}",
            remainder, volume_min
        ));
    }
    Ok(to_close)
}

/// Slippage applied against the requested price: current spread plus a
/// random jitter expressed in pips.
pub fn slippage_offset(spread: f64, jitter_pips: f64, pip_size: f64) -> f64 {
    spread.max(0.0) + jitter_pips.max(0.0) * pip_size
}
