//! Health Scorer
//!
//! 直近ウィンドウの遅延率・キャンセル率から 40〜100 のヘルススコアを出す。
//! キャンセルは遅延の 1.5 倍重く効く。
//!
//! Formula:
//!   penalty = late_rate * 200 + cancel_rate * 300
//!   score   = clamp(100 - penalty, 40, 100)

pub const MAX_SCORE: f64 = 100.0;
/// A catastrophic window still stays distinguishable from "no data"
pub const MIN_SCORE: f64 = 40.0;

const LATE_WEIGHT: f64 = 200.0;
const CANCEL_WEIGHT: f64 = 300.0;

/// Compute the bounded health score for one provider window
pub fn health_score(late_rate: f64, cancel_rate: f64) -> f64 {
    let penalty = late_rate * LATE_WEIGHT + cancel_rate * CANCEL_WEIGHT;
    (MAX_SCORE - penalty).clamp(MIN_SCORE, MAX_SCORE)
}
