//! Losses and evaluation scores for the reference trainer.

use nb_types::ScoreKind;

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable binary cross-entropy on a logit.
/// Returns `(loss, d loss / d logit)`.
pub fn bce_with_logits(logit: f32, target: f32) -> (f32, f32) {
    let max_val = 0.0f32.max(logit);
    let loss = max_val - logit * target + ((-logit.abs()).exp() + 1.0).ln();
    let grad = sigmoid(logit) - target;
    (loss, grad)
}

/// Softmax cross-entropy for one row of logits.
/// Writes `d loss / d logits` into `grad` and returns the loss.
pub fn softmax_cross_entropy(logits: &[f32], class: usize, grad: &mut [f32]) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (g, &l) in grad.iter_mut().zip(logits) {
        *g = (l - max).exp();
        sum += *g;
    }
    for g in grad.iter_mut() {
        *g /= sum;
    }
    let loss = -(grad[class].max(f32::MIN_POSITIVE)).ln();
    grad[class] -= 1.0;
    loss
}

pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Area under the ROC curve via the rank statistic, averaging tied ranks.
///
/// `None` when either class is missing.
pub fn roc_auc(scores: &[f32], labels: &[f32]) -> Option<f64> {
    let mut order: Vec<usize> = (0..scores.len().min(labels.len())).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let positives = order.iter().filter(|&&i| labels[i] > 0.5).count();
    let negatives = order.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut positive_rank_sum = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; tied group [start, end) shares the mean rank.
        let mean_rank = (start + end + 1) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| labels[i] > 0.5).count();
        positive_rank_sum += mean_rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Running loss and score over one epoch or one evaluation pass.
#[derive(Debug, Clone)]
pub struct ScoreTracker {
    kind: ScoreKind,
    loss_sum: f64,
    samples: usize,
    probabilities: Vec<f32>,
    labels: Vec<f32>,
    correct: usize,
}

impl ScoreTracker {
    pub fn new(kind: ScoreKind) -> Self {
        Self {
            kind,
            loss_sum: 0.0,
            samples: 0,
            probabilities: Vec::new(),
            labels: Vec::new(),
            correct: 0,
        }
    }

    /// Record a batch by its summed loss and per-sample probabilities.
    pub fn record_binary(&mut self, loss_sum: f64, probabilities: &[f32], labels: &[f32]) {
        self.loss_sum += loss_sum;
        self.samples += labels.len();
        self.probabilities.extend_from_slice(probabilities);
        self.labels.extend_from_slice(labels);
    }

    pub fn record_classes(&mut self, loss_sum: f64, predicted: &[usize], labels: &[f32]) {
        self.loss_sum += loss_sum;
        self.samples += labels.len();
        self.correct += predicted
            .iter()
            .zip(labels)
            .filter(|&(&p, &l)| p == l as usize)
            .count();
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.loss_sum / self.samples as f64
    }

    /// AUC falls back to 0.5 when the pass saw only one class.
    pub fn score(&self) -> f64 {
        match self.kind {
            ScoreKind::Auc => roc_auc(&self.probabilities, &self.labels).unwrap_or(0.5),
            ScoreKind::Accuracy if self.samples == 0 => 0.0,
            ScoreKind::Accuracy => self.correct as f64 / self.samples as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bce_matches_closed_form() {
        let (loss, grad) = bce_with_logits(0.0, 1.0);
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((grad + 0.5).abs() < 1e-6);

        // Stays finite for extreme logits.
        let (loss, grad) = bce_with_logits(80.0, 0.0);
        assert!(loss.is_finite() && (loss - 80.0).abs() < 1e-3);
        assert!((grad - 1.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_gradient_sums_to_zero() {
        let mut grad = [0.0; 3];
        let loss = softmax_cross_entropy(&[1.0, 2.0, 3.0], 2, &mut grad);
        assert!(loss > 0.0 && loss < 1.0);
        assert!(grad.iter().sum::<f32>().abs() < 1e-6);
        assert!(grad[2] < 0.0);
        assert_eq!(argmax(&[1.0, 2.0, 3.0]), 2);
    }

    #[test]
    fn auc_of_perfect_and_inverted_rankings() {
        let labels = [0.0, 0.0, 1.0, 1.0];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), Some(0.0));
        assert_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &labels), Some(0.5));
        assert_eq!(roc_auc(&[0.1, 0.2], &[1.0, 1.0]), None);
    }

    #[test]
    fn auc_counts_ties_as_half() {
        // One positive tied with one negative, the other strictly above.
        let auc = roc_auc(&[0.3, 0.5, 0.5, 0.9], &[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn tracker_accuracy_and_loss() {
        let mut tracker = ScoreTracker::new(ScoreKind::Accuracy);
        tracker.record_classes(2.0, &[0, 1, 2, 2], &[0.0, 1.0, 1.0, 2.0]);
        assert_eq!(tracker.samples(), 4);
        assert!((tracker.mean_loss() - 0.5).abs() < 1e-12);
        assert!((tracker.score() - 0.75).abs() < 1e-12);

        let empty = ScoreTracker::new(ScoreKind::Auc);
        assert_eq!(empty.mean_loss(), 0.0);
        assert_eq!(empty.score(), 0.5);
    }
}
