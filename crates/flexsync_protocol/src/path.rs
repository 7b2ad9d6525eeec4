//! Paths into nested collections.

use crate::types::InternString;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// One step of a [`Path`]: a field/dictionary key or a list index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathElement {
    /// Field name of an embedded object, or dictionary key.
    Field(InternString),
    /// List index.
    Index(u32),
}

impl PathElement {
    /// Returns the index if this element is an index.
    pub fn as_index(&self) -> Option<u32> {
        match self {
            PathElement::Index(i) => Some(*i),
            PathElement::Field(_) => None,
        }
    }

    /// Returns the interned field if this element is a field.
    pub fn as_field(&self) -> Option<InternString> {
        match self {
            PathElement::Field(s) => Some(*s),
            PathElement::Index(_) => None,
        }
    }
}

/// Ordered sequence of path elements below an object field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Path(Vec<PathElement>);

impl Path {
    /// Creates an empty path.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a field element.
    pub fn push_field(&mut self, field: InternString) {
        self.0.push(PathElement::Field(field));
    }

    /// Appends an index element.
    pub fn push_index(&mut self, index: u32) {
        self.0.push(PathElement::Index(index));
    }

    /// Appends an element.
    pub fn push(&mut self, element: PathElement) {
        self.0.push(element);
    }

    /// Removes the last element.
    pub fn pop(&mut self) -> Option<PathElement> {
        self.0.pop()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the path has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last element.
    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    /// Mutable access to the last element.
    pub fn last_mut(&mut self) -> Option<&mut PathElement> {
        self.0.last_mut()
    }

    /// Iterates the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, PathElement> {
        self.0.iter()
    }

    /// Returns the elements as a slice.
    pub fn as_slice(&self) -> &[PathElement] {
        &self.0
    }

    /// Returns the last element as an index, if it is one.
    pub fn last_index(&self) -> Option<u32> {
        self.last().and_then(PathElement::as_index)
    }
}

impl From<Vec<PathElement>> for Path {
    fn from(elements: Vec<PathElement>) -> Self {
        Self(elements)
    }
}

impl Index<usize> for Path {
    type Output = PathElement;

    fn index(&self, index: usize) -> &PathElement {
        &self.0[index]
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a PathElement;
    type IntoIter = std::slice::Iter<'a, PathElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
