use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use ndarray::Array1;
use serde::Serialize;

use crate::error::ForecastError;

/// Cut-offs for precision, recall and NDCG.
pub const TOP_K: [usize; 8] = [1, 3, 5, 10, 20, 30, 50, 100];

/// One model output aligned to its (day, stock) row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRow {
    pub datetime: NaiveDate,
    pub instrument: String,
    pub score: f64,
    pub label: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub std: f64,
}

impl Summary {
    /// Mean and population std over the defined (non-NaN) values.
    pub fn of(values: &[f64]) -> Self {
        let defined: Array1<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if defined.is_empty() {
            return Self { mean: f64::NAN, std: f64::NAN };
        }
        Self {
            mean: defined.mean().unwrap_or(f64::NAN),
            std: defined.std(0.0),
        }
    }
}

/// Which daily series drives checkpoint selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMetric {
    Ic,
    RankIc,
}

impl ValidationMetric {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ic => "IC",
            Self::RankIc => "RankIC",
        }
    }
}

impl FromStr for ValidationMetric {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "ic" => Ok(Self::Ic),
            "rankic" => Ok(Self::RankIc),
            _ => Err(ForecastError::UnknownMetric(s.to_string())),
        }
    }
}

/// Cross-sectional ranking quality, computed per day and averaged over days.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingMetrics {
    pub precision: BTreeMap<usize, f64>,
    pub recall: BTreeMap<usize, f64>,
    pub ndcg: BTreeMap<usize, f64>,
    pub daily_ic: Vec<f64>,
    pub daily_rank_ic: Vec<f64>,
    pub ic: Summary,
    pub rank_ic: Summary,
}

impl RankingMetrics {
    pub fn daily(&self, metric: ValidationMetric) -> &[f64] {
        match metric {
            ValidationMetric::Ic => &self.daily_ic,
            ValidationMetric::RankIc => &self.daily_rank_ic,
        }
    }

    pub fn precision_vec(&self) -> Vec<f64> {
        self.precision.values().copied().collect()
    }

    pub fn recall_vec(&self) -> Vec<f64> {
        self.recall.values().copied().collect()
    }

    pub fn ndcg_vec(&self) -> Vec<f64> {
        self.ndcg.values().copied().collect()
    }
}

pub fn metric_fn(rows: &[ScoredRow]) -> RankingMetrics {
    let mut days: BTreeMap<NaiveDate, Vec<(f64, f64)>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.label.is_finite()) {
        days.entry(row.datetime).or_default().push((row.score, row.label));
    }

    let mut precision: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    let mut recall: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    let mut ndcg: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    let mut daily_ic = Vec::with_capacity(days.len());
    let mut daily_rank_ic = Vec::with_capacity(days.len());

    for pairs in days.values_mut() {
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
        let labels: Vec<f64> = pairs.iter().map(|p| p.1).collect();
        let scores: Vec<f64> = pairs.iter().map(|p| p.0).collect();
        let positives = labels.iter().filter(|&&l| l > 0.0).count();
        let min_label = labels.iter().copied().fold(f64::INFINITY, f64::min);
        let relevance: Vec<f64> = labels.iter().map(|l| l - min_label).collect();

        for k in TOP_K {
            let hits = labels.iter().take(k).filter(|&&l| l > 0.0).count() as f64;
            precision.entry(k).or_default().push(hits / k as f64);
            let r = if positives == 0 { f64::NAN } else { hits / positives as f64 };
            recall.entry(k).or_default().push(r);
            ndcg.entry(k).or_default().push(ndcg_at(&relevance, k));
        }
        daily_ic.push(pearson(&scores, &labels));
        daily_rank_ic.push(pearson(&average_ranks(&scores), &average_ranks(&labels)));
    }

    let mean_by_k = |m: BTreeMap<usize, Vec<f64>>| -> BTreeMap<usize, f64> {
        TOP_K
            .iter()
            .map(|k| (*k, m.get(k).map_or(f64::NAN, |v| Summary::of(v).mean)))
            .collect()
    };

    RankingMetrics {
        precision: mean_by_k(precision),
        recall: mean_by_k(recall),
        ndcg: mean_by_k(ndcg),
        ic: Summary::of(&daily_ic),
        rank_ic: Summary::of(&daily_rank_ic),
        daily_ic,
        daily_rank_ic,
    }
}

/// `relevance` must already be in predicted order.
fn ndcg_at(relevance: &[f64], k: usize) -> f64 {
    let dcg = |rel: &[f64]| -> f64 {
        rel.iter()
            .take(k)
            .enumerate()
            .map(|(i, r)| r / ((i + 2) as f64).log2())
            .sum()
    };
    let mut ideal = relevance.to_vec();
    ideal.sort_by(|a, b| b.total_cmp(a));
    let idcg = dcg(&ideal);
    if idcg <= 0.0 {
        0.0
    } else {
        dcg(relevance) / idcg
    }
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    if x.len() < 2 {
        return f64::NAN;
    }
    let x = Array1::from(x.to_vec());
    let y = Array1::from(y.to_vec());
    let xc = &x - x.mean().unwrap_or(0.0);
    let yc = &y - y.mean().unwrap_or(0.0);
    let den = (xc.dot(&xc) * yc.dot(&yc)).sqrt();
    if den == 0.0 {
        f64::NAN
    } else {
        (xc.dot(&yc) / den).clamp(-1.0, 1.0)
    }
}

/// 1-based ranks, ties share their average rank.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}
