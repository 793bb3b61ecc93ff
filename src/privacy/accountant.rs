//! RDP (Renyi Differential Privacy) accountant.
//!
//! Per-step cost of the sampled Gaussian mechanism follows Mironov, Talwar &
//! Zhang (2019); conversion to (epsilon, delta) uses the classic
//! `eps = rdp + ln(1/delta) / (alpha - 1)` bound from Mironov (2017).

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use statrs::function::factorial::ln_binomial;

use crate::error::{Error, Result};

/// Series terms of the fractional-order expansion below this log-magnitude are dropped
const LOG_TERM_CUTOFF: f64 = -30.0;
const MAX_SERIES_TERMS: usize = 100_000;

/// Largest Rényi order the ledger evaluates; the integer expansion costs
/// `alpha + 1` terms and higher orders never give a tighter epsilon in practice
pub const MAX_ORDER: f64 = 1024.0;

/// RDP (Renyi Differential Privacy) accountant
///
/// Ledger of accumulated Rényi divergence per order. Totals only grow; a
/// fresh ledger is a fresh accountant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdpAccountant {
    /// RDP orders to track
    orders: Vec<f64>,
    /// Accumulated RDP values for each order
    rdp: Vec<f64>,
    /// Number of steps taken
    steps: usize,
}

impl RdpAccountant {
    /// Create an empty ledger over the given orders
    pub fn new(orders: Vec<f64>) -> Self {
        let rdp = vec![0.0; orders.len()];
        Self {
            orders,
            rdp,
            steps: 0,
        }
    }

    /// Record a training step
    pub fn record_step(&mut self, noise_multiplier: f64, sample_rate: f64) {
        self.record_steps(noise_multiplier, sample_rate, 1);
    }

    /// Record `steps` identical training steps
    pub fn record_steps(&mut self, noise_multiplier: f64, sample_rate: f64, steps: usize) {
        if steps == 0 {
            return;
        }
        let per_step = compute_rdp(sample_rate, noise_multiplier, &self.orders);
        for (total, cost) in self.rdp.iter_mut().zip(per_step) {
            *total += cost * steps as f64;
        }
        self.steps += steps;
    }

    /// Best `(epsilon, alpha)` for the given delta
    pub fn get_privacy_spent(&self, target_delta: f64) -> Result<(f64, f64)> {
        if !(target_delta > 0.0 && target_delta < 1.0) {
            return Err(Error::InvalidTargetDelta(target_delta));
        }
        if self.steps == 0 {
            return Err(Error::EmptyLedger);
        }
        rdp_to_dp(&self.orders, &self.rdp, target_delta)
    }

    pub fn orders(&self) -> &[f64] {
        &self.orders
    }

    /// Accumulated divergence per order, aligned with [`orders`](Self::orders)
    pub fn rdp(&self) -> &[f64] {
        &self.rdp
    }

    /// Get number of steps
    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// log(exp(a) + exp(b))
fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    (lo - hi).exp().ln_1p() + hi
}

/// log(exp(a) - exp(b)); negative differences round to -inf
fn log_sub(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a <= b {
        return f64::NEG_INFINITY;
    }
    let diff = (a - b).exp_m1();
    if diff.is_infinite() {
        a
    } else {
        diff.ln() + b
    }
}

/// log(erfc(x)), using the asymptotic tail series once erfc underflows
fn log_erfc(x: f64) -> f64 {
    let r = erfc(x);
    if r > 0.0 {
        return r.ln();
    }
    let x2 = x * x;
    -std::f64::consts::PI.ln() / 2.0 - x.ln() - x2 - 0.5 / x2 + 0.625 / x2.powi(2)
        - 37.0 / 24.0 / x2.powi(3)
        + 353.0 / 64.0 / x2.powi(4)
}

/// log(A_alpha) for integer alpha: a finite binomial sum
fn log_a_int(q: f64, sigma: f64, alpha: u64) -> f64 {
    let (log_q, log_1mq) = (q.ln(), (-q).ln_1p());
    (0..=alpha).fold(f64::NEG_INFINITY, |acc, j| {
        let jf = j as f64;
        let term = ln_binomial(alpha, j)
            + jf * log_q
            + (alpha as f64 - jf) * log_1mq
            + (jf * jf - jf) / (2.0 * sigma * sigma);
        log_add(acc, term)
    })
}

/// log(A_alpha) for fractional alpha: two converging series with erfc tails
fn log_a_frac(q: f64, sigma: f64, alpha: f64) -> f64 {
    let (log_q, log_1mq) = (q.ln(), (-q).ln_1p());
    let z0 = sigma * sigma * (1.0 / q - 1.0).ln() + 0.5;
    let two_sigma2 = 2.0 * sigma * sigma;
    let scale = std::f64::consts::SQRT_2 * sigma;

    let mut log_a0 = f64::NEG_INFINITY;
    let mut log_a1 = f64::NEG_INFINITY;
    // generalized binomial coefficient C(alpha, i), as log-magnitude and sign
    let mut log_coef = 0.0;
    let mut positive = true;

    for i in 0..MAX_SERIES_TERMS {
        let fi = i as f64;
        let j = alpha - fi;
        let log_t0 = log_coef + fi * log_q + j * log_1mq;
        let log_t1 = log_coef + j * log_q + fi * log_1mq;
        let log_e0 = 0.5f64.ln() + log_erfc((fi - z0) / scale);
        let log_e1 = 0.5f64.ln() + log_erfc((z0 - j) / scale);
        let log_s0 = log_t0 + (fi * fi - fi) / two_sigma2 + log_e0;
        let log_s1 = log_t1 + (j * j - j) / two_sigma2 + log_e1;

        if positive {
            log_a0 = log_add(log_a0, log_s0);
            log_a1 = log_add(log_a1, log_s1);
        } else {
            log_a0 = log_sub(log_a0, log_s0);
            log_a1 = log_sub(log_a1, log_s1);
        }

        if log_s0.max(log_s1) < LOG_TERM_CUTOFF {
            break;
        }

        let step = alpha - fi;
        if step == 0.0 {
            break;
        }
        log_coef += step.abs().ln() - (fi + 1.0).ln();
        if step < 0.0 {
            positive = !positive;
        }
    }

    log_add(log_a0, log_a1)
}

/// RDP of one step of the sampled Gaussian mechanism at order `alpha`
pub fn compute_rdp_sampled_gaussian(sample_rate: f64, noise_multiplier: f64, alpha: f64) -> f64 {
    if sample_rate <= 0.0 {
        return 0.0;
    }
    if noise_multiplier <= 0.0 || alpha.is_infinite() {
        return f64::INFINITY;
    }
    let sigma = noise_multiplier;
    if sample_rate >= 1.0 {
        return alpha / (2.0 * sigma * sigma);
    }
    if alpha > MAX_ORDER {
        return f64::INFINITY;
    }

    let log_a = if alpha.fract() == 0.0 {
        log_a_int(sample_rate, sigma, alpha as u64)
    } else {
        log_a_frac(sample_rate, sigma, alpha)
    };
    (log_a / (alpha - 1.0)).max(0.0)
}

/// Per-step RDP at every order
pub fn compute_rdp(sample_rate: f64, noise_multiplier: f64, orders: &[f64]) -> Vec<f64> {
    orders
        .iter()
        .map(|&alpha| compute_rdp_sampled_gaussian(sample_rate, noise_multiplier, alpha))
        .collect()
}

/// Convert an RDP ledger to the smallest `(epsilon, alpha)` for `delta`
pub fn rdp_to_dp(orders: &[f64], rdp: &[f64], delta: f64) -> Result<(f64, f64)> {
    if !(delta > 0.0 && delta < 1.0) {
        return Err(Error::InvalidTargetDelta(delta));
    }
    let log_inv_delta = -delta.ln();

    let mut best: Option<(f64, f64)> = None;
    for (&alpha, &rdp_alpha) in orders.iter().zip(rdp) {
        if alpha <= 1.0 {
            continue;
        }
        let epsilon = rdp_alpha + log_inv_delta / (alpha - 1.0);
        if epsilon.is_nan() {
            continue;
        }
        if best.map_or(true, |(e, _)| epsilon < e) {
            best = Some((epsilon, alpha));
        }
    }

    best.ok_or_else(|| Error::InvalidConfig("no usable Rényi order (all alphas <= 1)".to_string()))
}
