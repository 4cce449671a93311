use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing the wakers of every task waiting on a single
/// deferred value.
///
/// Each `Deferred` handle that has been polled owns at most one token in the
/// set. On subsequent polls the handle replaces its waker in place rather than
/// adding a new one, so a handle that is polled many times by the same task
/// doesn't grow the set. When the handle is dropped before the value settles,
/// it discards its token. When the value settles, the whole set is taken out
/// of the cell and every waker is woken.
///
/// Tokens cannot be cloned or otherwise duplicated outside of this module;
/// this ties each token's lifespan to exactly one handle.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. A WakerSet only lives as long as
    // its value is pending, so there's no chance of running out of these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::new(),
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. The token should be stored in the polling
    /// handle, and when the handle is re-polled, `replace_waker` should be
    /// used.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Store the waker for an existing token, or add it under a fresh token
    /// if the token is unknown to this set. Returns the token that now
    /// identifies the waker.
    ///
    /// The waker is passed by reference and is set with `clone_from` because
    /// it comes from a `Context` and would need to be cloned anyway.
    #[must_use]
    pub(crate) fn replace_waker(&mut self, token: Token, waker: &Waker) -> Token {
        match self.wakers.get_mut(&token) {
            Some(stored) => {
                stored.clone_from(waker);
                token
            }
            None => self.add_waker(waker.clone()),
        }
    }

    /// Discard a waker from this set. No-op if the token isn't present.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
