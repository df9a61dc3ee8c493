use crate::models::{EnrichmentResult, Grade, ProfitabilityScore};

/// Scores one enriched item. Pure: identical inputs give identical output.
///
/// Any missing input (no price, no fee estimate) gives a fully-null score with
/// `meets_threshold = false`. `roi` is undefined for a non-positive wholesale
/// cost and `margin` for a non-positive sell price.
pub fn score(
    result: &EnrichmentResult,
    wholesale_cost: f64,
    min_roi_percent: f64,
) -> ProfitabilityScore {
    score_parts(result.sell_price, result.fees_total, wholesale_cost, min_roi_percent)
}

pub fn score_parts(
    sell_price: Option<f64>,
    fees_total: Option<f64>,
    wholesale_cost: f64,
    min_roi_percent: f64,
) -> ProfitabilityScore {
    let (Some(sell_price), Some(fees_total)) = (sell_price, fees_total) else {
        return ProfitabilityScore::null();
    };
    if !(sell_price.is_finite() && fees_total.is_finite() && wholesale_cost.is_finite()) {
        return ProfitabilityScore::null();
    }

    let net_profit = sell_price - fees_total - wholesale_cost;
    let roi = (wholesale_cost > 0.0).then(|| net_profit / wholesale_cost * 100.0);
    let margin = (sell_price > 0.0).then(|| net_profit / sell_price * 100.0);

    ProfitabilityScore {
        net_profit: Some(round2(net_profit)),
        roi: roi.map(round2),
        margin: margin.map(round2),
        meets_threshold: roi.is_some_and(|roi| roi >= min_roi_percent),
        grade: roi.map(grade),
    }
}

/// Lower bounds are inclusive.
pub fn grade(roi: f64) -> Grade {
    match roi {
        r if r >= 50.0 => Grade::A,
        r if r >= 30.0 => Grade::B,
        r if r >= 15.0 => Grade::C,
        r if r >= 5.0 => Grade::D,
        _ => Grade::F,
    }
}

/// Stage-1 rough ROI: price minus an estimated referral fee and the catalog's
/// FBA fee when known. Optimistic by construction.
pub fn rough_roi(
    sell_price: f64,
    referral_pct: f64,
    fba_fee: Option<f64>,
    wholesale_cost: f64,
) -> Option<f64> {
    if wholesale_cost <= 0.0 {
        return None;
    }
    let fees = sell_price * referral_pct / 100.0 + fba_fee.unwrap_or(0.0);
    Some((sell_price - fees - wholesale_cost) / wholesale_cost * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageReached;

    #[test]
    fn scores_a_profitable_item() {
        let score = score_parts(Some(20.0), Some(6.0), 5.0, 30.0);
        assert_eq!(score.net_profit, Some(9.0));
        assert_eq!(score.roi, Some(180.0));
        assert_eq!(score.margin, Some(45.0));
        assert_eq!(score.grade, Some(Grade::A));
        assert!(score.meets_threshold);
    }

    #[test]
    fn missing_inputs_give_null_score() {
        assert_eq!(score_parts(None, Some(6.0), 5.0, 30.0), ProfitabilityScore::null());
        assert_eq!(score_parts(Some(20.0), None, 5.0, 30.0), ProfitabilityScore::null());

        let result = EnrichmentResult::empty("B00EXAMPLE", StageReached::Stage2);
        assert_eq!(score(&result, 5.0, 30.0), ProfitabilityScore::null());
    }

    #[test]
    fn zero_cost_leaves_roi_undefined() {
        let score = score_parts(Some(20.0), Some(6.0), 0.0, 30.0);
        assert_eq!(score.net_profit, Some(14.0));
        assert_eq!(score.roi, None);
        assert_eq!(score.grade, None);
        assert!(!score.meets_threshold);
        assert_eq!(score.margin, Some(70.0));
    }

    #[test]
    fn zero_price_leaves_margin_undefined() {
        let score = score_parts(Some(0.0), Some(0.0), 5.0, 30.0);
        assert_eq!(score.margin, None);
        assert_eq!(score.roi, Some(-100.0));
        assert_eq!(score.grade, Some(Grade::F));
    }

    #[test]
    fn grade_bounds_are_inclusive() {
        assert_eq!(grade(50.0), Grade::A);
        assert_eq!(grade(49.99), Grade::B);
        assert_eq!(grade(30.0), Grade::B);
        assert_eq!(grade(15.0), Grade::C);
        assert_eq!(grade(5.0), Grade::D);
        assert_eq!(grade(4.99), Grade::F);
        assert_eq!(grade(-20.0), Grade::F);
    }

    #[test]
    fn threshold_is_inclusive() {
        // 10 - 3 - 5 = 2 → 40%
        let score = score_parts(Some(10.0), Some(3.0), 5.0, 40.0);
        assert_eq!(score.roi, Some(40.0));
        assert!(score.meets_threshold);
    }

    #[test]
    fn scoring_is_repeatable() {
        let first = score_parts(Some(17.35), Some(5.11), 7.2, 30.0);
        let second = score_parts(Some(17.35), Some(5.11), 7.2, 30.0);
        assert_eq!(first, second);
    }

    #[test]
    fn rough_roi_uses_referral_and_fba() {
        // 20 - 3 - 2 - 5 = 10 → 200%
        assert_eq!(rough_roi(20.0, 15.0, Some(2.0), 5.0), Some(200.0));
        assert_eq!(rough_roi(20.0, 15.0, None, 0.0), None);
    }
}
