//! Ordered traversal.
//!
//! An iterator is a path of `(object id, position)` pairs from the root to
//! the current element. A position of -1 means "at this node's inner
//! value" (or at a leaf); otherwise it is the branch nibble taken.
//! Stepping advances the deepest position, descending into the first or
//! last element of each subtree it enters and popping exhausted nodes.

use marl::gc::SessionGuard;
use marl::ObjectId;

use crate::db::ReadSession;
use crate::key::{common_prefix_len, from_key6, to_key6};
use crate::node::{self, Node};

pub struct TrieIter<'s> {
    session: &'s ReadSession,
    path: Vec<(ObjectId, i16)>,
}

impl<'s> TrieIter<'s> {
    fn empty(session: &'s ReadSession) -> Self {
        TrieIter {
            session,
            path: Vec::new(),
        }
    }

    pub(crate) fn first(session: &'s ReadSession) -> Self {
        let mut it = Self::empty(session);
        if !session.session_revision().is_null() {
            let guard = session.guard();
            it.descend_first(&guard, session.session_revision());
        }
        it
    }

    pub(crate) fn last(session: &'s ReadSession) -> Self {
        let mut it = Self::empty(session);
        if !session.session_revision().is_null() {
            let guard = session.guard();
            it.descend_last(&guard, session.session_revision());
        }
        it
    }

    pub(crate) fn find(session: &'s ReadSession, key: &[u8]) -> Self {
        let k6 = to_key6(key);
        let mut it = Self::empty(session);
        let mut id = session.session_revision();
        if id.is_null() {
            return it;
        }
        let guard = session.guard();
        let mut key: &[u8] = &k6;
        loop {
            match session.node(&guard, id) {
                Node::Value(vn) => {
                    if vn.key6() == key {
                        it.path.push((id, -1));
                    } else {
                        it.path.clear();
                    }
                    return it;
                }
                Node::Inner(inn) => {
                    let in_key = inn.prefix6();
                    if key.len() < in_key.len() {
                        it.path.clear();
                        return it;
                    }
                    if key == in_key {
                        if inn.value_id().is_null() {
                            it.path.clear();
                        } else {
                            it.path.push((id, -1));
                        }
                        return it;
                    }
                    if &key[..in_key.len()] != in_key {
                        it.path.clear();
                        return it;
                    }
                    let b = key[in_key.len()];
                    if !inn.has_branch(b) {
                        it.path.clear();
                        return it;
                    }
                    it.path.push((id, b as i16));
                    key = &key[in_key.len() + 1..];
                    id = inn.branch_id(b);
                }
            }
        }
    }

    /// Position at the smallest element not less than `key`.
    pub(crate) fn lower_bound(session: &'s ReadSession, key: &[u8]) -> Self {
        let k6 = to_key6(key);
        let mut it = Self::empty(session);
        let mut id = session.session_revision();
        if id.is_null() {
            return it;
        }
        let guard = session.guard();
        let mut key: &[u8] = &k6;
        loop {
            match session.node(&guard, id) {
                Node::Value(vn) => {
                    it.path.push((id, -1));
                    if vn.key6() < key {
                        it.step_next(&guard);
                    }
                    return it;
                }
                Node::Inner(inn) => {
                    let in_key = inn.prefix6();
                    if in_key >= key {
                        // everything below this node sorts at or after key
                        it.descend_first(&guard, id);
                        return it;
                    }
                    let cpre = common_prefix_len(in_key, key);
                    if cpre == in_key.len() {
                        let kb = key[cpre];
                        match node::lower_bound(inn.branches(), kb as u16) {
                            Some(b) if b == kb => {
                                it.path.push((id, b as i16));
                                key = &key[cpre + 1..];
                                id = inn.branch_id(b);
                            }
                            Some(b) => {
                                // a later branch; its whole subtree is greater
                                it.path.push((id, b as i16));
                                it.descend_first(&guard, inn.branch_id(b));
                                return it;
                            }
                            None => {
                                // nothing at or after the wanted branch here
                                it.path.push((id, 63));
                                it.step_next(&guard);
                                return it;
                            }
                        }
                    } else if in_key[cpre] > key[cpre] {
                        it.descend_first(&guard, id);
                        return it;
                    } else {
                        it.path.push((id, 63));
                        it.step_next(&guard);
                        return it;
                    }
                }
            }
        }
    }

    /// Position at the largest element whose transcoded key starts with
    /// `prefix`'s nibbles.
    pub(crate) fn last_with_prefix(session: &'s ReadSession, prefix: &[u8]) -> Self {
        let p6 = to_key6(prefix);
        let mut it = Self::empty(session);
        let mut id = session.session_revision();
        if id.is_null() {
            return it;
        }
        let guard = session.guard();
        let mut prefix: &[u8] = &p6;
        loop {
            match session.node(&guard, id) {
                Node::Value(vn) => {
                    let k = vn.key6();
                    if k.len() >= prefix.len() && &k[..prefix.len()] == prefix {
                        it.path.push((id, -1));
                    } else {
                        it.path.clear();
                    }
                    return it;
                }
                Node::Inner(inn) => {
                    let in_key = inn.prefix6();
                    if prefix.len() <= in_key.len() {
                        if &in_key[..prefix.len()] == prefix {
                            it.descend_last(&guard, id);
                        } else {
                            it.path.clear();
                        }
                        return it;
                    }
                    if common_prefix_len(in_key, prefix) != in_key.len() {
                        it.path.clear();
                        return it;
                    }
                    let b = prefix[in_key.len()];
                    if !inn.has_branch(b) {
                        it.path.clear();
                        return it;
                    }
                    it.path.push((id, b as i16));
                    prefix = &prefix[in_key.len() + 1..];
                    id = inn.branch_id(b);
                }
            }
        }
    }

    pub fn valid(&self) -> bool {
        !self.path.is_empty()
    }

    /// Advance to the next element in key order; becomes invalid past the
    /// last element.
    pub fn next(&mut self) {
        let guard = self.session.guard();
        self.step_next(&guard);
    }

    /// Step back to the previous element; becomes invalid before the
    /// first element.
    pub fn prev(&mut self) {
        let guard = self.session.guard();
        self.step_prev(&guard);
    }

    /// The current element's key, decoded back to bytes.
    pub fn key(&self) -> Option<Vec<u8>> {
        if self.path.is_empty() {
            return None;
        }
        let guard = self.session.guard();
        let mut k6 = Vec::new();
        for (i, &(id, pos)) in self.path.iter().enumerate() {
            match self.session.node(&guard, id) {
                Node::Value(vn) => k6.extend_from_slice(vn.key6()),
                Node::Inner(inn) => k6.extend_from_slice(inn.prefix6()),
            }
            if i + 1 < self.path.len() {
                k6.push(pos as u8);
            }
        }
        Some(from_key6(&k6))
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        let &(id, _) = self.path.last()?;
        let guard = self.session.guard();
        match self.session.node(&guard, id) {
            Node::Value(vn) => Some(vn.value().to_vec()),
            Node::Inner(inn) => {
                let value_id = inn.value_id();
                debug_assert!(!value_id.is_null(), "iterator parked on a valueless inner node");
                match self.session.node(&guard, value_id) {
                    Node::Value(vn) => Some(vn.value().to_vec()),
                    Node::Inner(_) => None,
                }
            }
        }
    }

    fn step_next(&mut self, guard: &SessionGuard) {
        while let Some(&(id, pos)) = self.path.last() {
            if let Node::Inner(inn) = self.session.node(guard, id) {
                let from = (pos + 1).max(0) as u16;
                if let Some(b) = node::lower_bound(inn.branches(), from) {
                    self.path.last_mut().unwrap().1 = b as i16;
                    let child = inn.branch_id(b);
                    self.descend_first(guard, child);
                    return;
                }
            }
            self.path.pop();
        }
    }

    fn step_prev(&mut self, guard: &SessionGuard) {
        while let Some(&(id, pos)) = self.path.last() {
            let inn = match self.session.node(guard, id) {
                Node::Value(_) => {
                    self.path.pop();
                    continue;
                }
                Node::Inner(inn) => inn,
            };
            if pos < 0 {
                self.path.pop();
                continue;
            }
            let prev = if pos == 0 {
                None
            } else {
                node::reverse_lower_bound(inn.branches(), (pos - 1) as u8)
            };
            match prev {
                Some(b) => {
                    self.path.last_mut().unwrap().1 = b as i16;
                    let child = inn.branch_id(b);
                    self.descend_last(guard, child);
                    return;
                }
                None => {
                    if !inn.value_id().is_null() {
                        self.path.last_mut().unwrap().1 = -1;
                        return;
                    }
                    self.path.pop();
                }
            }
        }
    }

    /// Push the path down to the smallest element of `id`'s subtree.
    fn descend_first(&mut self, guard: &SessionGuard, mut id: ObjectId) {
        loop {
            match self.session.node(guard, id) {
                Node::Value(_) => {
                    self.path.push((id, -1));
                    return;
                }
                Node::Inner(inn) => {
                    if !inn.value_id().is_null() {
                        self.path.push((id, -1));
                        return;
                    }
                    let b = node::lower_bound(inn.branches(), 0)
                        .expect("inner node without value or branches");
                    self.path.push((id, b as i16));
                    id = inn.branch_id(b);
                }
            }
        }
    }

    /// Push the path down to the largest element of `id`'s subtree.
    fn descend_last(&mut self, guard: &SessionGuard, mut id: ObjectId) {
        loop {
            match self.session.node(guard, id) {
                Node::Value(_) => {
                    self.path.push((id, -1));
                    return;
                }
                Node::Inner(inn) => match node::reverse_lower_bound(inn.branches(), 63) {
                    Some(b) => {
                        self.path.push((id, b as i16));
                        id = inn.branch_id(b);
                    }
                    None => {
                        self.path.push((id, -1));
                        return;
                    }
                },
            }
        }
    }
}
