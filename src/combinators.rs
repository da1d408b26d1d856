//! Promises derived from several input promises.
//!
//! Every combined promise forwards its own cancellation to all of its inputs
//! (with the same `may_interrupt` flag), and is cancelled as soon as one of
//! its inputs is cancelled.

use super::{
    dispatch::Dispatcher,
    errors::TaskError,
    promise::{CancelLink, Promise, PromiseState, Value},
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Terminal outcome of one AfterAll input.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Resolved(T),
    Rejected(TaskError),
}

impl<T> Outcome<T> {
    pub fn state(&self) -> PromiseState {
        match self {
            Outcome::Resolved(_) => PromiseState::Resolved,
            Outcome::Rejected(_) => PromiseState::Rejected,
        }
    }
}

/// Index-aligned outcomes produced by [`after_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct MultipleResult<T> {
    outcomes: Vec<Outcome<T>>,
}

impl<T: Clone> MultipleResult<T> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<PromiseState> {
        self.outcomes.get(index).map(Outcome::state)
    }

    pub fn get(&self, index: usize) -> Option<&Outcome<T>> {
        self.outcomes.get(index)
    }

    /// Value of input `index`, or the error it was rejected with.
    /// An index out of range yields [`TaskError::AbsentValue`].
    pub fn result(&self, index: usize) -> Result<T, TaskError> {
        match self.outcomes.get(index) {
            Some(Outcome::Resolved(value)) => Ok(value.clone()),
            Some(Outcome::Rejected(error)) => Err(error.clone()),
            None => Err(TaskError::AbsentValue),
        }
    }

    pub fn result_or_default(&self, index: usize, default: T) -> T {
        self.result(index).unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outcome<T>> {
        self.outcomes.iter()
    }

    pub fn into_outcomes(self) -> Vec<Outcome<T>> {
        self.outcomes
    }
}

fn dispatcher_of<T: Value, P: Value>(inputs: &[Promise<T, P>]) -> Dispatcher {
    inputs
        .first()
        .map(|input| input.dispatcher().clone())
        .unwrap_or_else(Dispatcher::inline)
}

/// Output promise whose cancellation fans out to `inputs`; cancelling any
/// input cancels it back.
fn combined<T: Value, P: Value, U: Value>(inputs: &[Promise<T, P>]) -> Promise<U, P> {
    let targets = inputs.to_vec();
    let link: Arc<dyn CancelLink> = Arc::new(move |may_interrupt: bool| {
        for input in &targets {
            input.try_cancel(may_interrupt);
        }
    });
    let out = Promise::linked(dispatcher_of(inputs), link);
    for input in inputs {
        let on_cancel = out.clone();
        input.on_cancel(move || {
            on_cancel.try_cancel(false);
        });
    }
    out
}

struct Slots<V> {
    slots: Vec<Option<V>>,
    remaining: usize,
}

impl<V> Slots<V> {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }
    }

    /// Fills slot `index` once; returns every slot when the last one fills.
    fn fill(&mut self, index: usize, value: V) -> Option<Vec<V>> {
        if self.slots[index].is_some() {
            return None;
        }
        self.slots[index] = Some(value);
        self.remaining -= 1;
        if self.remaining > 0 {
            return None;
        }
        Some(self.slots.drain(..).flatten().collect())
    }
}

/// Resolves with every value, in input order, once all inputs resolve.
/// Rejects with the first rejection. No inputs resolve to an empty vector.
pub fn all_of<T, P, I>(promises: I) -> Promise<Vec<T>, P>
where
    T: Value,
    P: Value,
    I: IntoIterator<Item = Promise<T, P>>,
{
    let inputs: Vec<_> = promises.into_iter().collect();
    let out = combined(&inputs);
    if inputs.is_empty() {
        out.try_resolve(Vec::new());
        return out;
    }

    let values = Arc::new(Mutex::new(Slots::new(inputs.len())));
    for (index, input) in inputs.iter().enumerate() {
        let values = Arc::clone(&values);
        let on_done = out.clone();
        let on_fail = out.clone();
        input
            .done(move |value| {
                let complete = {
                    let mut values = values.lock();
                    if !on_done.is_pending() {
                        return;
                    }
                    values.fill(index, value.clone())
                };
                if let Some(values) = complete {
                    on_done.try_resolve(values);
                }
            })
            .fail(move |error| {
                on_fail.try_reject(error.clone());
            });
    }
    out
}

/// Resolves with the first input to resolve. Rejects with
/// [`TaskError::AllInputsFailed`] (errors in input order) once every input
/// has rejected; no inputs reject right away with an empty list.
pub fn any_of<T, P, I>(promises: I) -> Promise<T, P>
where
    T: Value,
    P: Value,
    I: IntoIterator<Item = Promise<T, P>>,
{
    let inputs: Vec<_> = promises.into_iter().collect();
    let out = combined(&inputs);
    if inputs.is_empty() {
        out.try_reject(TaskError::AllInputsFailed(Vec::new()));
        return out;
    }

    let errors = Arc::new(Mutex::new(Slots::new(inputs.len())));
    for (index, input) in inputs.iter().enumerate() {
        let errors = Arc::clone(&errors);
        let on_done = out.clone();
        let on_fail = out.clone();
        input
            .done(move |value| {
                on_done.try_resolve(value.clone());
            })
            .fail(move |error| {
                let complete = {
                    let mut errors = errors.lock();
                    if !on_fail.is_pending() {
                        return;
                    }
                    errors.fill(index, error.clone())
                };
                if let Some(errors) = complete {
                    on_fail.try_reject(TaskError::AllInputsFailed(errors));
                }
            });
    }
    out
}

/// Waits for every input to resolve or reject and collects the outcomes.
/// Never rejects on its own.
pub fn after_all<T, P, I>(promises: I) -> Promise<MultipleResult<T>, P>
where
    T: Value,
    P: Value,
    I: IntoIterator<Item = Promise<T, P>>,
{
    let inputs: Vec<_> = promises.into_iter().collect();
    let out = combined(&inputs);
    if inputs.is_empty() {
        out.try_resolve(MultipleResult {
            outcomes: Vec::new(),
        });
        return out;
    }

    let outcomes = Arc::new(Mutex::new(Slots::new(inputs.len())));
    for (index, input) in inputs.iter().enumerate() {
        let record = {
            let outcomes = Arc::clone(&outcomes);
            let out = out.clone();
            move |outcome: Outcome<T>| {
                let complete = {
                    let mut outcomes = outcomes.lock();
                    if !out.is_pending() {
                        return;
                    }
                    outcomes.fill(index, outcome)
                };
                if let Some(outcomes) = complete {
                    out.try_resolve(MultipleResult { outcomes });
                }
            }
        };
        let record = Arc::new(record);
        let on_fail = Arc::clone(&record);
        input
            .done(move |value| record(Outcome::Resolved(value.clone())))
            .fail(move |error| on_fail(Outcome::Rejected(error.clone())));
    }
    out
}

/// Resolves with `main`'s value; if `main` rejects, with `fallback`'s.
/// Rejects with [`TaskError::BothBranchesFailed`] if both reject.
pub fn or<T, P>(main: &Promise<T, P>, fallback: &Promise<T, P>) -> Promise<T, P>
where
    T: Value,
    P: Value,
{
    let targets = vec![main.clone(), fallback.clone()];
    let link: Arc<dyn CancelLink> = Arc::new(move |may_interrupt: bool| {
        for branch in &targets {
            branch.try_cancel(may_interrupt);
        }
    });
    let out = Promise::linked(main.dispatcher().clone(), link);

    let on_done = out.clone();
    let on_cancel = out.clone();
    let on_fail = out.clone();
    let fallback = fallback.clone();
    main.done(move |value| {
        on_done.try_resolve(value.clone());
    })
    .on_cancel(move || {
        on_cancel.try_cancel(false);
    })
    .fail(move |main_error| {
        let main_error = main_error.clone();
        let on_done = on_fail.clone();
        let on_cancel = on_fail.clone();
        fallback
            .done(move |value| {
                on_done.try_resolve(value.clone());
            })
            .fail(move |fallback_error| {
                on_fail.try_reject(TaskError::BothBranchesFailed {
                    main: Box::new(main_error),
                    fallback: Box::new(fallback_error.clone()),
                });
            })
            .on_cancel(move || {
                on_cancel.try_cancel(false);
            });
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_complete_once() {
        let mut slots = Slots::new(2);
        assert_eq!(slots.fill(1, "b"), None);
        assert_eq!(slots.fill(1, "x"), None);
        assert_eq!(slots.fill(0, "a"), Some(vec!["a", "b"]));
    }

    #[test]
    fn multiple_result_accessors() {
        let result = MultipleResult {
            outcomes: vec![Outcome::Resolved(1), Outcome::Rejected(TaskError::msg("e"))],
        };
        assert_eq!(result.len(), 2);
        assert_eq!(result.state(1), Some(PromiseState::Rejected));
        assert_eq!(result.result(1), Err(TaskError::msg("e")));
        assert_eq!(result.result_or_default(1, 9), 9);
        assert_eq!(result.result(5), Err(TaskError::AbsentValue));
        assert_eq!(result.state(5), None);
    }
}
