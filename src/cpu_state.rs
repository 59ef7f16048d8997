use std::{
    cell::RefCell,
    mem::ManuallyDrop,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};
use crate::nuts::Direction;

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerState>>>,
}

impl StateStorage {
    fn with_capacity(capacity: usize) -> StateStorage {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }
}

impl ReuseState for StateStorage {
    fn reuse_state(&self, state: Rc<InnerState>) {
        self.free_states.borrow_mut().push(state)
    }
}

/// Allocates phase space points and takes them back when they are dropped.
pub(crate) struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub(crate) fn new(dim: usize) -> StatePool {
        StatePool::with_capacity(dim, 64)
    }

    pub(crate) fn with_capacity(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage::with_capacity(capacity)),
            dim,
        }
    }

    pub(crate) fn new_state(&mut self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => {
                assert!(self.dim == inner.q.len(), "dim mismatch");
                inner
            }
            None => {
                let owner: Rc<dyn ReuseState> = self.storage.clone();
                Rc::new(InnerState::new(self.dim, &owner))
            }
        };
        State {
            inner: ManuallyDrop::new(inner),
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.storage.free_states.borrow().len()
    }
}

trait ReuseState {
    fn reuse_state(&self, state: Rc<InnerState>);
}

pub(crate) struct InnerState {
    pub(crate) p: Box<[f64]>,
    pub(crate) q: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
    reuser: Weak<dyn ReuseState>,
}

impl InnerState {
    fn new(size: usize, owner: &Rc<dyn ReuseState>) -> InnerState {
        InnerState {
            p: vec![0.; size].into(),
            q: vec![0.; size].into(),
            v: vec![0.; size].into(),
            p_sum: vec![0.; size].into(),
            grad: vec![0.; size].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
            reuser: Rc::downgrade(owner),
        }
    }
}

/// A shared handle to a point in phase space.
///
/// The point goes back to its pool when the last handle is dropped.
pub(crate) struct State {
    inner: ManuallyDrop<Rc<InnerState>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

#[derive(Debug)]
pub(crate) struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(val),
            None => Err(StateInUse {}),
        }
    }

    /// The total energy (potential + kinetic)
    pub(crate) fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub(crate) fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    pub(crate) fn write_position(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.q);
    }

    /// Compute the termination criterion for NUTS between this point and
    /// `other`.
    ///
    /// `p_sum` holds the sum of the momenta between the initial point and
    /// this point, so the summed momentum of the sub-trajectory between
    /// two points can be reconstructed from the two sums.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (&**self, &**other)
        } else {
            (&**other, &**self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;
        assert!(a < b);

        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    /// `exp` of this is the Metropolis acceptance probability of a move from
    /// a point with energy `initial_energy` to this point.
    pub(crate) fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut InnerState, epsilon: f64) {
        axpy_out(&self.grad, &self.p, epsilon / 2., &mut out.p);
    }

    pub(crate) fn position_step(&self, out: &mut InnerState, epsilon: f64) {
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn set_psum(&self, target: &mut InnerState, dir: Direction) {
        assert!(self.idx_in_trajectory != 0 || target.idx_in_trajectory.abs() == 1);

        if target.idx_in_trajectory == -1 {
            target.p_sum.copy_from_slice(&target.p);
        } else {
            let (p_sum, p) = (&mut target.p_sum, &target.p);
            p_sum.copy_from_slice(&self.p_sum);
            axpy(p, p_sum, 1.);
        }
        debug_assert!(match dir {
            Direction::Forward => target.idx_in_trajectory > 0,
            Direction::Backward => target.idx_in_trajectory < 0,
        });
    }
}

impl InnerState {
    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.grad, &mut self.p, epsilon / 2.);
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let mut rc = unsafe { ManuallyDrop::take(&mut self.inner) };
        if Rc::get_mut(&mut rc).is_some() {
            if let Some(reuser) = rc.reuser.upgrade() {
                reuser.reuse_state(rc);
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(pool: &mut StatePool, idx: i64, p: &[f64], p_sum: &[f64], v: &[f64]) -> State {
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();
        inner.idx_in_trajectory = idx;
        inner.p.copy_from_slice(p);
        inner.p_sum.copy_from_slice(p_sum);
        inner.v.copy_from_slice(v);
        state
    }

    #[test]
    fn states_are_reused() {
        let mut pool = StatePool::with_capacity(10, 20);
        let mut state = pool.new_state();
        assert!(state.p.len() == 10);
        state.try_mut_inner().unwrap();

        let copy = state.clone();
        assert!(state.try_mut_inner().is_err());
        drop(copy);
        assert!(state.try_mut_inner().is_ok());

        assert_eq!(pool.free_count(), 0);
        drop(state);
        assert_eq!(pool.free_count(), 1);
        let _state = pool.new_state();
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn turning_forward() {
        let mut pool = StatePool::new(1);
        // Momentum changes sign between the two end points.
        let start = state_at(&mut pool, 0, &[1.], &[1.], &[1.]);
        let end = state_at(&mut pool, 2, &[-3.], &[-1.], &[-3.]);
        assert!(start.is_turning(&end));
        assert!(end.is_turning(&start));

        let end = state_at(&mut pool, 2, &[1.], &[3.], &[1.]);
        assert!(!start.is_turning(&end));
    }

    #[test]
    fn turning_across_the_initial_point() {
        let mut pool = StatePool::new(1);
        let left = state_at(&mut pool, -1, &[1.], &[1.], &[1.]);
        let right = state_at(&mut pool, 1, &[1.], &[2.], &[1.]);
        assert!(!left.is_turning(&right));

        let right = state_at(&mut pool, 1, &[-5.], &[-4.], &[-5.]);
        assert!(left.is_turning(&right));
    }
}
