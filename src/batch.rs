use crate::token::{Pos, SeqId, TokenId};

/// Input carried by a batch: discrete tokens or precomputed embedding rows.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Tokens(Vec<TokenId>),
    /// Row-major `[n_tokens, n_embd]` embedding matrix.
    Embeddings { data: Vec<f32>, n_embd: usize },
}

/// Represents a batch of tokens for processing
///
/// Mirrors the backend's decode contract: one entry per cell, each with a
/// position, the sequences it belongs to and whether logits are wanted for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    input: BatchInput,
    pos: Vec<Pos>,
    seq_ids: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
}

impl Batch {
    /// Create an empty token batch with room for `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            input: BatchInput::Tokens(Vec::with_capacity(capacity)),
            pos: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
        }
    }

    /// Create a batch from consecutive tokens of sequence 0 starting at `pos_0`.
    ///
    /// Only the last token requests logits, which is what sampling needs.
    pub fn from_tokens(tokens: &[TokenId], pos_0: Pos) -> Self {
        let mut batch = Self::new(tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            batch.add(token, pos_0 + i as Pos, &[0], i + 1 == tokens.len());
        }
        batch
    }

    /// Create an embedding batch of `n_tokens` rows placed at sequential
    /// positions starting at `pos_0`. No logits are requested.
    pub fn from_embeddings(data: Vec<f32>, n_embd: usize, pos_0: Pos, seq_id: SeqId) -> Self {
        let n_tokens = if n_embd == 0 { 0 } else { data.len() / n_embd };
        Self {
            input: BatchInput::Embeddings { data, n_embd },
            pos: (0..n_tokens).map(|i| pos_0 + i as Pos).collect(),
            seq_ids: vec![vec![seq_id]; n_tokens],
            logits: vec![false; n_tokens],
        }
    }

    /// Append one token. Has no effect on embedding batches.
    pub fn add(&mut self, token: TokenId, pos: Pos, seq_ids: &[SeqId], logits: bool) {
        if let BatchInput::Tokens(tokens) = &mut self.input {
            tokens.push(token);
            self.pos.push(pos);
            self.seq_ids.push(seq_ids.to_vec());
            self.logits.push(logits);
        }
    }

    /// Remove all entries, keeping the allocation
    pub fn clear(&mut self) {
        match &mut self.input {
            BatchInput::Tokens(tokens) => tokens.clear(),
            BatchInput::Embeddings { data, .. } => data.clear(),
        }
        self.pos.clear();
        self.seq_ids.clear();
        self.logits.clear();
    }

    pub fn input(&self) -> &BatchInput {
        &self.input
    }

    /// Token ids, `None` for embedding batches
    pub fn tokens(&self) -> Option<&[TokenId]> {
        match &self.input {
            BatchInput::Tokens(tokens) => Some(tokens),
            BatchInput::Embeddings { .. } => None,
        }
    }

    pub fn positions(&self) -> &[Pos] {
        &self.pos
    }

    pub fn seq_ids(&self) -> &[Vec<SeqId>] {
        &self.seq_ids
    }

    pub fn logits_mask(&self) -> &[bool] {
        &self.logits
    }

    /// Get the number of cells in the batch
    pub fn len(&self) -> usize {
        self.pos.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    pub fn is_embedding(&self) -> bool {
        matches!(self.input, BatchInput::Embeddings { .. })
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tokens_positions_and_logits() {
        let batch = Batch::from_tokens(&[10, 11, 12], 5);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.positions(), &[5, 6, 7]);
        assert_eq!(batch.logits_mask(), &[false, false, true]);
        assert_eq!(batch.tokens(), Some(&[10, 11, 12][..]));
        assert!(batch.seq_ids().iter().all(|s| s == &vec![0]));
    }

    #[test]
    fn test_from_embeddings() {
        let batch = Batch::from_embeddings(vec![0.5; 4 * 3], 3, 10, 0);
        assert!(batch.is_embedding());
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.positions(), &[10, 11, 12, 13]);
        assert!(batch.logits_mask().iter().all(|l| !l));
        assert!(batch.tokens().is_none());
    }

    #[test]
    fn test_clear_keeps_kind() {
        let mut batch = Batch::from_tokens(&[1, 2], 0);
        batch.clear();
        assert!(batch.is_empty());
        batch.add(7, 3, &[0], true);
        assert_eq!(batch.tokens(), Some(&[7][..]));
    }
}
