/// Token identifier as used by the backend vocabulary.
pub type TokenId = i32;

/// Position of a cell in the rolling context.
pub type Pos = i32;

/// Sequence identifier inside a context. Every session decodes into sequence 0
/// of its own context.
pub type SeqId = i32;

/// A sampled token with its decoded bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    pub piece: Vec<u8>,
}

impl Token {
    /// The piece as text, or `None` when it is not a complete UTF-8 sequence.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.piece).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_utf8_piece() {
        let token = Token {
            id: 7,
            piece: vec![0xE2, 0x82],
        };
        assert!(token.text().is_none());

        let token = Token {
            id: 8,
            piece: "€".as_bytes().to_vec(),
        };
        assert_eq!(token.text(), Some("€"));
    }
}
