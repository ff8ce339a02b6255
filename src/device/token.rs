//! Channel tokens and token buffers.
//!
//! Everything that travels over a channel route is a [`Token`]: an 8-bit
//! value plus a control flag. Control tokens carry the routing protocol
//! (`END`/`PAUSE` close routes, `ACK`/`NACK` answer switch requests, the
//! `CREDIT*` family implements link-level flow control).

use std::collections::VecDeque;

use crate::device::Ticks;

/// Control token values.
pub mod control {
    pub const CT_HDR: u8 = 0;
    pub const CT_END: u8 = 1;
    pub const CT_PAUSE: u8 = 2;
    pub const CT_ACK: u8 = 3;
    pub const CT_NACK: u8 = 4;
    pub const CT_WRITEC: u8 = 0xC0;
    pub const CT_READC: u8 = 0xC1;
    pub const CT_CREDIT8: u8 = 0xE0;
    pub const CT_CREDIT64: u8 = 0xE1;
    pub const CT_CREDIT16: u8 = 0xE4;
    pub const CT_HELLO: u8 = 0xE6;
}

/// An 8-bit token with a control flag and a capture timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    value: u8,
    control: bool,
    time: Ticks,
}

impl Token {
    pub fn data(value: u8, time: Ticks) -> Self {
        Token { value, control: false, time }
    }

    pub fn ctrl(value: u8, time: Ticks) -> Self {
        Token { value, control: true, time }
    }

    #[inline]
    pub fn value(&self) -> u8 {
        self.value
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.control
    }

    #[inline]
    pub fn is_ct_end(&self) -> bool {
        self.control && self.value == control::CT_END
    }

    #[inline]
    pub fn is_ct_pause(&self) -> bool {
        self.control && self.value == control::CT_PAUSE
    }

    #[inline]
    pub fn time(&self) -> Ticks {
        self.time
    }
}

/// Bounded FIFO of tokens. Capacity is fixed at construction; callers must
/// check [`TokenBuffer::remaining`] before pushing.
#[derive(Debug, Clone)]
pub struct TokenBuffer {
    buf: VecDeque<Token>,
    capacity: usize,
}

impl TokenBuffer {
    pub fn new(capacity: usize) -> Self {
        TokenBuffer {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// Free slots left in the buffer.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Push a token. The caller must have checked there is room.
    pub fn push_back(&mut self, token: Token) {
        debug_assert!(!self.is_full(), "token buffer overflow");
        self.buf.push_back(token);
    }

    pub fn pop_front(&mut self) -> Option<Token> {
        self.buf.pop_front()
    }

    /// Drop the first `n` tokens.
    pub fn drop_front(&mut self, n: usize) {
        for _ in 0..n {
            self.buf.pop_front();
        }
    }

    pub fn front(&self) -> Option<&Token> {
        self.buf.front()
    }

    pub fn get(&self, index: usize) -> Option<&Token> {
        self.buf.get(index)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_flags() {
        let t = Token::data(0xAB, 5);
        assert_eq!(t.value(), 0xAB);
        assert!(!t.is_control());
        assert!(!t.is_ct_end());
        assert_eq!(t.time(), 5);

        let end = Token::ctrl(control::CT_END, 0);
        assert!(end.is_ct_end());
        assert!(!end.is_ct_pause());
    }

    #[test]
    fn test_buffer_capacity() {
        let mut buf = TokenBuffer::new(2);
        assert_eq!(buf.remaining(), 2);
        buf.push_back(Token::data(1, 0));
        buf.push_back(Token::data(2, 0));
        assert!(buf.is_full());
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.pop_front().unwrap().value(), 1);
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn test_drop_front() {
        let mut buf = TokenBuffer::new(8);
        for i in 0..4 {
            buf.push_back(Token::data(i, 0));
        }
        buf.drop_front(3);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.front().unwrap().value(), 3);
    }
}
