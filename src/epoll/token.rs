/// Opaque handle binding a registered source to its owning selector's
/// readiness stream. Selector Pool registrations key their per-thread slab by
/// this value (see `pool::TaskQueue` and `channel::Channel`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
