//! Trie of path segments backing the router.
//!
//! Each node is literal, parameter or greedy-tail typed and keeps its
//! children in explicit ordered lists: literal children are tried before
//! parameter children *structurally*, and siblings within a list in insertion
//! order — priority falls out of the walk, there is no numeric score. The
//! walk is depth-first with backtracking, so a route with a longer literal
//! prefix always beats a shallower greedy one.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use smallvec::SmallVec;

use super::{ParamVec, RouteTarget};

/// One parsed segment of a route template.
pub(super) enum TemplateSegment {
    Literal(String),
    /// `:name` — matches any single segment, binds it.
    Param(Arc<str>),
    /// `:name*` — terminal, captures the rest of the path verbatim.
    Tail(Arc<str>),
}

pub(super) struct TrieNode {
    kind: TemplateSegment,
    targets: HashMap<Method, Arc<RouteTarget>>,
    literal_children: Vec<TrieNode>,
    param_children: Vec<TrieNode>,
    tail_child: Option<Box<TrieNode>>,
}

impl TrieNode {
    pub(super) fn root() -> Self {
        Self::new(TemplateSegment::Literal(String::new()))
    }

    fn new(kind: TemplateSegment) -> Self {
        TrieNode {
            kind,
            targets: HashMap::new(),
            literal_children: Vec::new(),
            param_children: Vec::new(),
            tail_child: None,
        }
    }

    fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    pub(super) fn target(&self, method: &Method) -> Option<&Arc<RouteTarget>> {
        self.targets.get(method)
    }

    pub(super) fn methods(&self) -> SmallVec<[Method; 4]> {
        self.targets.keys().cloned().collect()
    }

    /// Insert a route, creating intermediate nodes as needed.
    ///
    /// Returns `false` if a route for this (template, method) already existed
    /// and was replaced.
    pub(super) fn insert(
        &mut self,
        segments: &[TemplateSegment],
        method: Method,
        target: Arc<RouteTarget>,
    ) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return self.targets.insert(method, target).is_none();
        };

        match head {
            TemplateSegment::Literal(text) => {
                let idx = self
                    .literal_children
                    .iter()
                    .position(|c| {
                        matches!(&c.kind, TemplateSegment::Literal(existing) if existing == text)
                    })
                    .unwrap_or_else(|| {
                        self.literal_children
                            .push(TrieNode::new(TemplateSegment::Literal(text.clone())));
                        self.literal_children.len() - 1
                    });
                self.literal_children[idx].insert(rest, method, target)
            }
            TemplateSegment::Param(name) => {
                let idx = self
                    .param_children
                    .iter()
                    .position(|c| {
                        matches!(&c.kind, TemplateSegment::Param(existing) if existing == name)
                    })
                    .unwrap_or_else(|| {
                        self.param_children
                            .push(TrieNode::new(TemplateSegment::Param(Arc::clone(name))));
                        self.param_children.len() - 1
                    });
                self.param_children[idx].insert(rest, method, target)
            }
            TemplateSegment::Tail(name) => {
                // Terminal by construction; the parser rejects segments after
                // a greedy parameter.
                let child = self
                    .tail_child
                    .get_or_insert_with(|| {
                        Box::new(TrieNode::new(TemplateSegment::Tail(Arc::clone(name))))
                    });
                child.targets.insert(method, target).is_none()
            }
        }
    }

    /// Depth-first match of `segments`, binding parameters into `params`.
    ///
    /// The node is selected by path alone; the caller decides between a
    /// handler hit, an OPTIONS shortcut and a 405.
    pub(super) fn find<'a>(
        &'a self,
        segments: &[&str],
        params: &mut ParamVec,
    ) -> Option<&'a TrieNode> {
        let Some((head, rest)) = segments.split_first() else {
            if self.has_targets() {
                return Some(self);
            }
            // A greedy child may still terminate here with an empty capture.
            return self.try_tail(&[], params);
        };

        for child in &self.literal_children {
            if matches!(&child.kind, TemplateSegment::Literal(text) if text == head) {
                if let Some(found) = child.find(rest, params) {
                    return Some(found);
                }
            }
        }

        for child in &self.param_children {
            if let TemplateSegment::Param(name) = &child.kind {
                params.push((Arc::clone(name), (*head).to_string()));
                if let Some(found) = child.find(rest, params) {
                    return Some(found);
                }
                params.pop();
            }
        }

        self.try_tail(segments, params)
    }

    /// A greedy tail always wins once reached, capturing the remainder
    /// verbatim (including `/`).
    fn try_tail<'a>(&'a self, remainder: &[&str], params: &mut ParamVec) -> Option<&'a TrieNode> {
        let child = self.tail_child.as_deref()?;
        if !child.has_targets() {
            return None;
        }
        if let TemplateSegment::Tail(name) = &child.kind {
            params.push((Arc::clone(name), remainder.join("/")));
        }
        Some(child)
    }
}
