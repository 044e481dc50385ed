// Beam search over any step-wise decoder
use crate::error::{Result, TranslatorError};

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub num_beams: usize,
    pub early_stopping: bool,
    pub no_repeat_ngram_size: usize,
    pub length_penalty: f32,
    /// Content tokens allowed after the decoder start and forced tokens.
    pub max_new_tokens: usize,
    /// End-of-sequence is masked until this many content tokens exist.
    pub min_new_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_beams: 5,
            early_stopping: true,
            no_repeat_ngram_size: 3,
            length_penalty: 1.0,
            max_new_tokens: 512,
            min_new_tokens: 1,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
}

/// One incremental decoding session with one row per beam.
pub trait BeamDecoder {
    /// Feeds the newest token of every beam and returns next-token logits, one row per beam.
    fn step(&mut self, last_tokens: &[u32]) -> Result<Vec<Vec<f32>>>;

    /// Makes row `i` continue from the previous row `order[i]`.
    fn reorder(&mut self, order: &[usize]) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

impl Hypothesis {
    fn normalized_score(&self, length_penalty: f32, prompt_len: usize) -> f32 {
        let len = self.tokens.len().saturating_sub(prompt_len) as f32;
        if len > 0.0 {
            self.score / len.powf(length_penalty)
        } else {
            self.score
        }
    }
}

struct FinishedHypotheses {
    hypotheses: Vec<(f32, Hypothesis)>,
    num_beams: usize,
    length_penalty: f32,
    prompt_len: usize,
}

impl FinishedHypotheses {
    fn new(num_beams: usize, length_penalty: f32, prompt_len: usize) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            prompt_len,
        }
    }

    fn worst_score(&self) -> f32 {
        self.hypotheses
            .last()
            .map(|(score, _)| *score)
            .unwrap_or(f32::NEG_INFINITY)
    }

    fn add(&mut self, hypothesis: Hypothesis) {
        if hypothesis.score == f32::NEG_INFINITY {
            return;
        }
        let score = hypothesis.normalized_score(self.length_penalty, self.prompt_len);
        if self.hypotheses.len() < self.num_beams || score > self.worst_score() {
            self.hypotheses.push((score, hypothesis));
            self.hypotheses.sort_by(|a, b| b.0.total_cmp(&a.0));
            self.hypotheses.truncate(self.num_beams);
        }
    }

    fn is_done(&self, early_stopping: bool, best_running_score: f32, cur_len: usize) -> bool {
        if self.hypotheses.len() < self.num_beams {
            return false;
        }
        if early_stopping {
            return true;
        }
        let len = cur_len.saturating_sub(self.prompt_len).max(1) as f32;
        self.worst_score() >= best_running_score / len.powf(self.length_penalty)
    }

    fn into_best(self) -> Option<Hypothesis> {
        self.hypotheses.into_iter().next().map(|(_, h)| h)
    }
}

pub(crate) fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    let log_sum = sum.ln() + max;
    logits.iter().map(|l| l - log_sum).collect()
}

/// Bans every token that would complete an n-gram already present in `tokens`.
pub(crate) fn apply_no_repeat_ngram(log_probs: &mut [f32], tokens: &[u32], ngram_size: usize) {
    if ngram_size == 0 || tokens.len() + 1 < ngram_size {
        return;
    }
    let prefix = &tokens[tokens.len() + 1 - ngram_size..];
    for window in tokens.windows(ngram_size) {
        if &window[..ngram_size - 1] == prefix {
            if let Some(lp) = log_probs.get_mut(window[ngram_size - 1] as usize) {
                *lp = f32::NEG_INFINITY;
            }
        }
    }
}

fn top_k(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut candidates: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(id, lp)| (id as u32, *lp))
        .collect();
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
        candidates.truncate(k);
    }
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    candidates
}

/// Runs beam search and returns the best full sequence, start token included.
///
/// When `forced_bos` is set the first generated token is forced to it; that
/// token does not count against `max_new_tokens`.
pub fn beam_search<D: BeamDecoder>(
    decoder: &mut D,
    config: &GenerationConfig,
    start_token: u32,
    forced_bos: Option<u32>,
    eos_token: u32,
) -> Result<Vec<u32>> {
    let num_beams = config.num_beams.max(1);
    let prompt_len = 1 + usize::from(forced_bos.is_some());
    let total_steps = prompt_len - 1 + config.max_new_tokens;

    let mut beams: Vec<Hypothesis> = (0..num_beams)
        .map(|i| Hypothesis {
            tokens: vec![start_token],
            score: if i == 0 { 0.0 } else { f32::NEG_INFINITY },
        })
        .collect();
    let mut finished = FinishedHypotheses::new(num_beams, config.length_penalty, prompt_len);
    let mut stopped_early = false;

    for step in 0..total_steps {
        let last_tokens: Vec<u32> = beams
            .iter()
            .map(|b| *b.tokens.last().unwrap_or(&start_token))
            .collect();
        let rows = decoder.step(&last_tokens)?;
        if rows.len() != beams.len() {
            return Err(TranslatorError::Generation(format!(
                "decoder returned {} rows for {} beams",
                rows.len(),
                beams.len()
            )));
        }

        // (score, source beam, token)
        let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(num_beams * num_beams * 2);
        for (beam_idx, (beam, row)) in beams.iter().zip(rows.iter()).enumerate() {
            if beam.score == f32::NEG_INFINITY {
                continue;
            }
            let mut log_probs = log_softmax(row);
            match forced_bos {
                Some(forced) if step == 0 => {
                    log_probs.iter_mut().for_each(|lp| *lp = f32::NEG_INFINITY);
                    if let Some(lp) = log_probs.get_mut(forced as usize) {
                        *lp = 0.0;
                    }
                }
                _ => {
                    let generated = beam.tokens.len() - prompt_len;
                    if generated < config.min_new_tokens {
                        if let Some(lp) = log_probs.get_mut(eos_token as usize) {
                            *lp = f32::NEG_INFINITY;
                        }
                    }
                    apply_no_repeat_ngram(&mut log_probs, &beam.tokens, config.no_repeat_ngram_size);
                }
            }
            for (token, lp) in top_k(&log_probs, 2 * num_beams) {
                candidates.push((beam.score + lp, beam_idx, token));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates.truncate(2 * num_beams);

        let mut next_beams = Vec::with_capacity(num_beams);
        let mut order = Vec::with_capacity(num_beams);
        for (rank, (score, source, token)) in candidates.into_iter().enumerate() {
            let mut tokens = beams[source].tokens.clone();
            tokens.push(token);
            let hypothesis = Hypothesis { tokens, score };
            if token == eos_token {
                if rank < num_beams {
                    finished.add(hypothesis);
                }
            } else {
                next_beams.push(hypothesis);
                order.push(source);
                if next_beams.len() == num_beams {
                    break;
                }
            }
        }

        let best_running = next_beams
            .first()
            .map(|b| b.score)
            .unwrap_or(f32::NEG_INFINITY);
        if next_beams.is_empty() || finished.is_done(config.early_stopping, best_running, step + 2) {
            stopped_early = true;
            break;
        }

        while next_beams.len() < num_beams {
            let filler = next_beams[next_beams.len() - 1].tokens.clone();
            next_beams.push(Hypothesis {
                tokens: filler,
                score: f32::NEG_INFINITY,
            });
            order.push(order[order.len() - 1]);
        }

        decoder.reorder(&order)?;
        beams = next_beams;
    }

    if !stopped_early {
        for beam in beams {
            finished.add(beam);
        }
    }

    finished
        .into_best()
        .map(|h| h.tokens)
        .ok_or_else(|| TranslatorError::Generation("beam search produced no hypothesis".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const START: u32 = 2;
    const EOS: u32 = 2;
    const LANG: u32 = 10;
    const VOCAB: usize = 12;

    /// Logits depend only on the last token.
    struct ScriptedDecoder {
        table: HashMap<u32, Vec<(u32, f32)>>,
        fed: Vec<Vec<u32>>,
        reorders: Vec<Vec<usize>>,
    }

    impl ScriptedDecoder {
        fn new(entries: &[(u32, &[(u32, f32)])]) -> Self {
            Self {
                table: entries.iter().map(|(k, v)| (*k, v.to_vec())).collect(),
                fed: Vec::new(),
                reorders: Vec::new(),
            }
        }
    }

    impl BeamDecoder for ScriptedDecoder {
        fn step(&mut self, last_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
            self.fed.push(last_tokens.to_vec());
            Ok(last_tokens
                .iter()
                .map(|token| {
                    let mut row = vec![-10.0; VOCAB];
                    for (id, logit) in self.table.get(token).into_iter().flatten() {
                        row[*id as usize] = *logit;
                    }
                    row
                })
                .collect())
        }

        fn reorder(&mut self, order: &[usize]) -> Result<()> {
            self.reorders.push(order.to_vec());
            Ok(())
        }
    }

    fn config(max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig::default().with_max_new_tokens(max_new_tokens)
    }

    #[test]
    fn forces_first_token_and_stops_at_eos() {
        let mut decoder = ScriptedDecoder::new(&[
            (START, &[(7, 10.0)]),
            (LANG, &[(5, 10.0)]),
            (5, &[(6, 10.0)]),
            (6, &[(EOS, 10.0)]),
        ]);
        let tokens = beam_search(&mut decoder, &config(16), START, Some(LANG), EOS).unwrap();
        assert_eq!(tokens, vec![START, LANG, 5, 6, EOS]);
        assert!(decoder.fed[1].contains(&LANG));
        assert!(!decoder.fed[1].contains(&7));
    }

    #[test]
    fn truncates_at_max_new_tokens() {
        let mut decoder = ScriptedDecoder::new(&[(LANG, &[(5, 10.0)]), (5, &[(5, 10.0)])]);
        let mut config = config(4);
        config.no_repeat_ngram_size = 0;
        let tokens = beam_search(&mut decoder, &config, START, Some(LANG), EOS).unwrap();
        assert_eq!(tokens, vec![START, LANG, 5, 5, 5, 5]);
        assert_eq!(decoder.fed.len(), 5);
    }

    #[test]
    fn single_token_budget_yields_one_content_token() {
        let mut decoder = ScriptedDecoder::new(&[(LANG, &[(EOS, 10.0), (4, 5.0)])]);
        let tokens = beam_search(&mut decoder, &config(1), START, Some(LANG), EOS).unwrap();
        assert_eq!(tokens, vec![START, LANG, 4]);
    }

    #[test]
    fn repeated_trigrams_are_suppressed() {
        let mut decoder = ScriptedDecoder::new(&[
            (LANG, &[(5, 10.0)]),
            (5, &[(6, 10.0)]),
            (6, &[(5, 10.0)]),
        ]);
        let mut config = config(8);
        config.num_beams = 1;
        let tokens = beam_search(&mut decoder, &config, START, Some(LANG), EOS).unwrap();
        let content = &tokens[2..];
        for window in content.windows(3) {
            let count = content.windows(3).filter(|w| *w == window).count();
            assert_eq!(count, 1, "trigram {window:?} repeated in {content:?}");
        }
    }

    #[test]
    fn reorders_once_per_continued_step() {
        let mut decoder = ScriptedDecoder::new(&[
            (LANG, &[(5, 10.0)]),
            (5, &[(6, 10.0)]),
            (6, &[(EOS, 10.0)]),
        ]);
        beam_search(&mut decoder, &config(16), START, Some(LANG), EOS).unwrap();
        assert!(decoder.fed.len() - decoder.reorders.len() <= 1);
        assert!(decoder.reorders.iter().all(|o| o.len() == 5));
        // only beam 0 is alive after the forced step
        assert!(decoder.reorders[0].iter().all(|i| *i == 0));
    }

    #[test]
    fn no_repeat_ngram_bans_completion() {
        let mut log_probs = vec![0.0; 8];
        apply_no_repeat_ngram(&mut log_probs, &[5, 6, 7, 5, 6], 3);
        assert_eq!(log_probs[7], f32::NEG_INFINITY);
        assert!(log_probs.iter().filter(|lp| lp.is_infinite()).count() == 1);
    }

    #[test]
    fn no_repeat_ngram_ignores_short_history() {
        let mut log_probs = vec![0.0; 8];
        apply_no_repeat_ngram(&mut log_probs, &[5], 3);
        assert!(log_probs.iter().all(|lp| *lp == 0.0));
    }

    #[test]
    fn log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(lp[2] > lp[1] && lp[1] > lp[0]);
    }
}
