//! Differentiable values and gradient accumulators.
//!
//! This is the small capability contract the recurrent machinery relies on:
//! a value can report its output, say whether it is constant with respect to a
//! gradient, and push an upstream gradient into an accumulator keyed by
//! [`VarId`]. The R forms additionally carry a directional derivative.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::Array1;

pub type Vector = Array1<f64>;

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a [`Variable`], used as the accumulator key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl VarId {
    fn next() -> Self {
        VarId(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A leaf of the computation: a vector with an identity.
///
/// Parameters are Variables shared through `Rc` so that an optimizer can
/// update them between passes. Updating a Variable invalidates any block
/// output computed from it.
#[derive(Debug)]
pub struct Variable {
    id: VarId,
    vector: RefCell<Vector>,
}

impl Variable {
    pub fn new(vector: Vector) -> Rc<Self> {
        Rc::new(Self {
            id: VarId::next(),
            vector: RefCell::new(vector),
        })
    }

    pub fn zeros(len: usize) -> Rc<Self> {
        Self::new(Vector::zeros(len))
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.vector.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vector(&self) -> Ref<'_, Vector> {
        self.vector.borrow()
    }

    pub fn vector_mut(&self) -> RefMut<'_, Vector> {
        self.vector.borrow_mut()
    }
}

/// Accumulated gradients keyed by variable identity.
///
/// Only variables with an entry receive gradient; a value whose variables have
/// no entries is constant.
#[derive(Debug, Clone, Default)]
pub struct Gradient {
    entries: HashMap<VarId, Vector>,
}

/// Derivatives of a [`Gradient`] with respect to R. Same layout.
pub type RGradient = Gradient;

impl Gradient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroed entries for every variable in `vars`.
    pub fn for_variables(vars: &[Rc<Variable>]) -> Self {
        let mut g = Self::new();
        for v in vars {
            g.insert(v.id(), Vector::zeros(v.len()));
        }
        g
    }

    pub fn insert(&mut self, id: VarId, vector: Vector) {
        self.entries.insert(id, vector);
    }

    pub fn remove(&mut self, id: VarId) -> Option<Vector> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: VarId) -> Option<&Vector> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: VarId) -> Option<&mut Vector> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Adds `upstream` into the entry for `id`, if there is one.
    pub fn accumulate(&mut self, id: VarId, upstream: &Vector) {
        if let Some(acc) = self.entries.get_mut(&id) {
            *acc += upstream;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> + '_ {
        self.entries.keys().copied()
    }

    /// Scales every entry, e.g. to average over a batch.
    pub fn scale(&mut self, factor: f64) {
        for v in self.entries.values_mut() {
            v.mapv_inplace(|x| x * factor);
        }
    }
}

/// A perturbation direction for the R operator. Missing entries are zero.
#[derive(Debug, Clone, Default)]
pub struct RVector {
    entries: HashMap<VarId, Vector>,
}

impl RVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: VarId, vector: Vector) {
        self.entries.insert(id, vector);
    }

    pub fn get(&self, id: VarId) -> Option<&Vector> {
        self.entries.get(&id)
    }

    /// Direction for `var`, zero when the direction does not mention it.
    pub fn direction_for(&self, var: &Variable) -> Vector {
        self.get(var.id())
            .cloned()
            .unwrap_or_else(|| Vector::zeros(var.len()))
    }
}

/// A node that can report its output and back-propagate into a [`Gradient`].
pub trait Value {
    fn output(&self) -> Vector;

    fn constant(&self, g: &Gradient) -> bool;

    fn propagate_gradient(&self, upstream: &Vector, g: &mut Gradient);
}

/// A node that also reports and back-propagates R derivatives.
pub trait RValue {
    fn output(&self) -> Vector;

    fn r_output(&self) -> Vector;

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool;

    fn propagate_r_gradient(
        &self,
        upstream: &Vector,
        upstream_r: &Vector,
        rg: &mut RGradient,
        g: &mut Gradient,
    );
}

impl Value for Variable {
    fn output(&self) -> Vector {
        self.vector().clone()
    }

    fn constant(&self, g: &Gradient) -> bool {
        !g.contains(self.id)
    }

    fn propagate_gradient(&self, upstream: &Vector, g: &mut Gradient) {
        g.accumulate(self.id, upstream);
    }
}

/// A [`Variable`] paired with its derivative with respect to R.
#[derive(Debug, Clone)]
pub struct RVariable {
    pub variable: Rc<Variable>,
    pub r_output: Vector,
}

impl RVariable {
    /// Looks up the variable's R output in `rv`.
    pub fn new(variable: Rc<Variable>, rv: &RVector) -> Self {
        let r_output = rv.direction_for(&variable);
        Self { variable, r_output }
    }

    pub fn with_r_output(variable: Rc<Variable>, r_output: Vector) -> Self {
        assert_eq!(
            variable.len(),
            r_output.len(),
            "R output length must match variable length"
        );
        Self { variable, r_output }
    }
}

impl RValue for RVariable {
    fn output(&self) -> Vector {
        self.variable.output()
    }

    fn r_output(&self) -> Vector {
        self.r_output.clone()
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        let id = self.variable.id();
        !g.contains(id) && !rg.contains(id)
    }

    fn propagate_r_gradient(
        &self,
        upstream: &Vector,
        upstream_r: &Vector,
        rg: &mut RGradient,
        g: &mut Gradient,
    ) {
        let id = self.variable.id();
        g.accumulate(id, upstream);
        rg.accumulate(id, upstream_r);
    }
}
