//! Operational transformation of divergent operation sequences.
//!
//! Given two sequences `A` and `B` that were both produced against the same
//! document state, [`OperationTransformer::transform`] returns `A'` and `B'`
//! such that applying `A` then `B'` yields the same document as applying `B`
//! then `A'`.
//!
//! # Algorithm
//!
//! 1. Take the operations of `B` one at a time, in order
//! 2. Transform the whole of `A` against that single operation, pairwise
//! 3. A pair may turn into several operations on either side (a removal
//!    split by an insertion) or into none (a removal swallowed by another);
//!    extra `B` pieces are carried through the rest of `A` recursively
//! 4. The transformed `A` becomes the input for the next `B` operation
//!
//! Pairwise rules live in a [`TransformMatrix`], keyed by the
//! alphabetically ordered pair of operation types. Ties between equal
//! positions are broken in favour of `B`, which by convention holds the
//! operations already accepted by the server.

use crate::{OperationFactory, OperationSpec, TransformError};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Result of transforming one operation against another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairTransform {
    pub specs_a: Vec<OperationSpec>,
    pub specs_b: Vec<OperationSpec>,
}

impl PairTransform {
    pub fn new(specs_a: Vec<OperationSpec>, specs_b: Vec<OperationSpec>) -> Self {
        Self { specs_a, specs_b }
    }

    /// Both operations stay as they are.
    pub fn unchanged(spec_a: OperationSpec, spec_b: OperationSpec) -> Self {
        Self::new(vec![spec_a], vec![spec_b])
    }

    fn swapped(self) -> Self {
        Self::new(self.specs_b, self.specs_a)
    }
}

/// A pairwise transformation rule.
///
/// Receives the two specs ordered by operation type and whether the first
/// one wins ties. Returns `None` if the pair cannot be reconciled.
pub type TransformRule =
    Arc<dyn Fn(OperationSpec, OperationSpec, bool) -> Option<PairTransform> + Send + Sync>;

/// Rule for operation pairs that do not affect each other.
pub fn pass_unchanged(
    spec_a: OperationSpec,
    spec_b: OperationSpec,
    _a_has_priority: bool,
) -> Option<PairTransform> {
    Some(PairTransform::unchanged(spec_a, spec_b))
}

/// Table of pairwise transformation rules.
///
/// A missing entry means the pair is unresolvable. Operations that only the
/// server originates (member bookkeeping) never meet each other in a
/// transformation and need no entry between themselves.
#[derive(Clone, Default)]
pub struct TransformMatrix {
    rules: BTreeMap<String, BTreeMap<String, TransformRule>>,
}

impl fmt::Debug for TransformMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<_> = self
            .rules
            .iter()
            .flat_map(|(a, row)| row.keys().map(move |b| format!("{a}/{b}")))
            .collect();
        f.debug_struct("TransformMatrix")
            .field("pairs", &pairs)
            .finish()
    }
}

impl TransformMatrix {
    /// Create an empty matrix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule for a pair of operation types.
    ///
    /// The rule is written for `optype_a` as its first argument. If
    /// `optype_a` sorts after `optype_b` the rule is stored mirrored, so
    /// callers can register pairs in whatever order reads best.
    pub fn insert<R>(&mut self, optype_a: &str, optype_b: &str, rule: R)
    where
        R: Fn(OperationSpec, OperationSpec, bool) -> Option<PairTransform> + Send + Sync + 'static,
    {
        let (first, second, rule): (&str, &str, TransformRule) = if optype_a <= optype_b {
            (optype_a, optype_b, Arc::new(rule))
        } else {
            (
                optype_b,
                optype_a,
                Arc::new(move |b, a, b_has_priority| {
                    rule(a, b, !b_has_priority).map(PairTransform::swapped)
                }),
            )
        };
        self.rules
            .entry(first.to_string())
            .or_default()
            .insert(second.to_string(), rule);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_rule<R>(mut self, optype_a: &str, optype_b: &str, rule: R) -> Self
    where
        R: Fn(OperationSpec, OperationSpec, bool) -> Option<PairTransform> + Send + Sync + 'static,
    {
        self.insert(optype_a, optype_b, rule);
        self
    }

    /// Add all rules of another matrix, overriding existing entries.
    pub fn extend(&mut self, other: TransformMatrix) {
        for (first, row) in other.rules {
            let target = self.rules.entry(first).or_default();
            for (second, rule) in row {
                target.insert(second, rule);
            }
        }
    }

    /// Whether a rule exists for the pair, in either order.
    pub fn contains(&self, optype_a: &str, optype_b: &str) -> bool {
        self.rule(optype_a, optype_b).is_some()
    }

    fn rule(&self, optype_a: &str, optype_b: &str) -> Option<&TransformRule> {
        let (first, second) = if optype_a <= optype_b {
            (optype_a, optype_b)
        } else {
            (optype_b, optype_a)
        };
        self.rules.get(first).and_then(|row| row.get(second))
    }

    /// Transform `spec_a` against `spec_b`; `spec_b` wins ties.
    pub fn transform_pair(
        &self,
        spec_a: &OperationSpec,
        spec_b: &OperationSpec,
    ) -> Result<PairTransform, TransformError> {
        let unresolvable = || TransformError {
            optype_a: spec_a.optype().to_string(),
            optype_b: spec_b.optype().to_string(),
        };
        let rule = self
            .rule(spec_a.optype(), spec_b.optype())
            .ok_or_else(unresolvable)?;

        if spec_a.optype() <= spec_b.optype() {
            rule(spec_a.clone(), spec_b.clone(), false).ok_or_else(unresolvable)
        } else {
            rule(spec_b.clone(), spec_a.clone(), true)
                .map(PairTransform::swapped)
                .ok_or_else(unresolvable)
        }
    }
}

/// Result of transforming two sequences against each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformResult {
    /// The first sequence, rewritten to apply after the second one.
    pub specs_a: Vec<OperationSpec>,
    /// The second sequence, rewritten to apply after the first one.
    pub specs_b: Vec<OperationSpec>,
}

/// Transforms whole operation sequences using a [`TransformMatrix`].
///
/// Pure and deterministic: the same inputs always give the same outputs.
#[derive(Debug, Clone, Default)]
pub struct OperationTransformer {
    matrix: TransformMatrix,
}

impl OperationTransformer {
    pub fn new(matrix: TransformMatrix) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &TransformMatrix {
        &self.matrix
    }

    pub fn matrix_mut(&mut self) -> &mut TransformMatrix {
        &mut self.matrix
    }

    /// Transform two divergent sequences produced against the same state.
    ///
    /// `specs_b` has priority in ties. Fails if any encountered pair has no
    /// transformation rule.
    pub fn transform(
        &self,
        specs_a: &[OperationSpec],
        specs_b: &[OperationSpec],
    ) -> Result<TransformResult, TransformError> {
        let mut transformed_a: VecDeque<OperationSpec> = specs_a.iter().cloned().collect();
        let mut transformed_b = Vec::with_capacity(specs_b.len());

        for spec_b in specs_b {
            let result = self.transform_list_vs_op(transformed_a, spec_b.clone())?;
            transformed_a = result.specs_a.into();
            transformed_b.extend(result.specs_b);
        }

        Ok(TransformResult {
            specs_a: transformed_a.into(),
            specs_b: transformed_b,
        })
    }

    /// Like [`transform`](Self::transform), but instantiates the results.
    ///
    /// Specs the factory does not recognise are dropped.
    pub fn transform_operations<F: OperationFactory>(
        &self,
        factory: &F,
        specs_a: &[OperationSpec],
        specs_b: &[OperationSpec],
    ) -> Result<(Vec<F::Op>, Vec<F::Op>), TransformError> {
        let result = self.transform(specs_a, specs_b)?;
        let ops_a = result.specs_a.iter().filter_map(|s| factory.create(s)).collect();
        let ops_b = result.specs_b.iter().filter_map(|s| factory.create(s)).collect();
        Ok((ops_a, ops_b))
    }

    fn transform_list_vs_op(
        &self,
        mut specs_a: VecDeque<OperationSpec>,
        spec_b: OperationSpec,
    ) -> Result<TransformResult, TransformError> {
        let mut transformed_a = Vec::with_capacity(specs_a.len());
        let mut transformed_b = Vec::new();
        let mut current_b = Some(spec_b);

        while let Some(spec_b) = current_b.take() {
            let Some(spec_a) = specs_a.pop_front() else {
                current_b = Some(spec_b);
                break;
            };

            let PairTransform {
                specs_a: pair_a,
                specs_b: mut pair_b,
            } = self.matrix.transform_pair(&spec_a, &spec_b)?;
            transformed_a.extend(pair_a);

            // B vanished: the rest of A is unaffected.
            if pair_b.is_empty() {
                transformed_a.extend(specs_a.drain(..));
                break;
            }

            // B split: carry every piece but the last through the rest of A,
            // then continue with the last piece as the single B.
            while pair_b.len() > 1 {
                let piece = pair_b.remove(0);
                let rest = self.transform_list_vs_op(std::mem::take(&mut specs_a), piece)?;
                transformed_b.extend(rest.specs_b);
                specs_a = rest.specs_a.into();
            }
            current_b = pair_b.pop();
        }

        if let Some(spec_b) = current_b {
            transformed_b.push(spec_b);
        }

        Ok(TransformResult {
            specs_a: transformed_a,
            specs_b: transformed_b,
        })
    }
}
