//! Dropping client connections under overload.

use ferry_http::server::{ConnState, Score};
use std::cell::RefCell;
use std::rc::Rc;

const MAX_DROP: usize = 32;

/// Per-worker registry of live connections, ranked by score for the
/// drop policy.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: RefCell<Vec<Rc<ConnState>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, state: Rc<ConnState>) {
        self.conns.borrow_mut().push(state);
    }

    /// Drop registry entries whose connection has ended (we hold the
    /// only reference left).
    fn gc(&self) {
        self.conns
            .borrow_mut()
            .retain(|c| Rc::strong_count(c) > 1 && !c.closing.get());
    }

    pub fn count(&self) -> usize {
        self.gc();
        self.conns.borrow().len()
    }

    /// Mark up to 32 of the lowest-score connections for closing and
    /// return how many were marked.
    pub fn drop_some(&self) -> usize {
        self.gc();
        let conns = self.conns.borrow();

        let mut victims: Vec<&Rc<ConnState>> = Vec::with_capacity(MAX_DROP);
        let mut min_score = Score::Success;
        let mut first = true;

        for c in conns.iter() {
            let score = c.score.get();

            if first || score < min_score {
                // found a new minimum: restart the list
                victims.clear();
                min_score = score;
                first = false;
            }

            if score == min_score && victims.len() < MAX_DROP {
                victims.push(c);
                if score == Score::New && victims.len() >= MAX_DROP {
                    break;
                }
            }
        }

        let n = victims.len();
        for v in &victims {
            v.closing.set(true);
        }
        tracing::info!(dropping = n, total = conns.len(), "dropping connections");
        n
    }
}
