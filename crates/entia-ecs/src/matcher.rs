//! Predicates over segments.
//!
//! A [`Matcher`] decides whether a work unit touches a segment. Matchers are
//! simplified as they are built: constant operands are absorbed and constant
//! results short-circuit, so `Matcher::all([Matcher::False, ..])` *is*
//! `Matcher::False` and callers can test for [`Matcher::True`] to recognize an
//! unrestricted selection.

use std::any::TypeId;
use std::ops::Not;
use std::sync::Arc;

use crate::meta::Component;
use crate::segment::Segment;
use crate::world::World;

/// A boolean predicate over `(Segment, World)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Matches every segment.
    True,
    /// Matches no segment.
    False,
    /// Matches segments whose signature contains the type, provided the type
    /// is registered with the world.
    Has(TypeId),
    /// Negation.
    Not(Box<Matcher>),
    /// Conjunction; never contains `True`, `False` or nested `All`.
    All(Vec<Matcher>),
    /// Disjunction; never contains `True`, `False` or nested `Any`.
    Any(Vec<Matcher>),
}

impl Matcher {
    /// Segments storing `T`.
    pub fn has<T: Component>() -> Self {
        Self::Has(TypeId::of::<T>())
    }

    /// Conjunction of `matchers`.
    pub fn all(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        let mut operands = Vec::new();
        for matcher in matchers {
            match matcher {
                Self::True => {}
                Self::False => return Self::False,
                Self::All(inner) => operands.extend(inner),
                other => operands.push(other),
            }
        }
        match operands.len() {
            0 => Self::True,
            1 => operands.remove(0),
            _ => Self::All(operands),
        }
    }

    /// Disjunction of `matchers`.
    pub fn any(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        let mut operands = Vec::new();
        for matcher in matchers {
            match matcher {
                Self::False => {}
                Self::True => return Self::True,
                Self::Any(inner) => operands.extend(inner),
                other => operands.push(other),
            }
        }
        match operands.len() {
            0 => Self::False,
            1 => operands.remove(0),
            _ => Self::Any(operands),
        }
    }

    /// Segments matched by none of `matchers`.
    pub fn none(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        Self::all(matchers.into_iter().map(Not::not))
    }

    /// Evaluate against one segment.
    pub fn matches(&self, segment: &Segment, world: &World) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Has(type_id) => world
                .try_meta(*type_id)
                .is_some_and(|meta| segment.has(meta)),
            Self::Not(inner) => !inner.matches(segment, world),
            Self::All(operands) => operands.iter().all(|m| m.matches(segment, world)),
            Self::Any(operands) => operands.iter().any(|m| m.matches(segment, world)),
        }
    }

    /// Every segment of `world` this matcher selects.
    pub fn segments(&self, world: &World) -> Vec<Arc<Segment>> {
        match self {
            Self::False => Vec::new(),
            _ => world
                .segments()
                .iter()
                .filter(|s| self.matches(s, world))
                .cloned()
                .collect(),
        }
    }
}

impl Not for Matcher {
    type Output = Matcher;

    fn not(self) -> Matcher {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
