//! Reply trees.
//!
//! A thread is an arena of nodes; node 0 is the root. Children are kept in
//! insertion order, which callers make equal to written-time order.

use crate::entity::Message;
use crate::types::Id;

/// Index of a node inside its [`Thread`].
pub type NodeRef = usize;

#[derive(Debug, Clone)]
pub struct Node {
    msg: Message,
    parent: Option<NodeRef>,
    children: Vec<NodeRef>,
    depth: usize,
}

impl Node {
    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Zero for the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Result of a viewing handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// Pre-order reader of a thread.
pub trait ViewingVisitor {
    fn visit(&mut self, node: &Node) -> Visit;
}

impl<F: FnMut(&Node) -> Visit> ViewingVisitor for F {
    fn visit(&mut self, node: &Node) -> Visit {
        self(node)
    }
}

/// Pre-order filter producing a new thread. Returning `None` prunes the
/// node together with its subtree.
pub trait ModeratingVisitor {
    fn moderate(&mut self, node: &Node) -> Option<Message>;
}

impl<F: FnMut(&Node) -> Option<Message>> ModeratingVisitor for F {
    fn moderate(&mut self, node: &Node) -> Option<Message> {
        self(node)
    }
}

#[derive(Debug, Clone)]
pub struct Thread {
    nodes: Vec<Node>,
}

impl Thread {
    pub const ROOT: NodeRef = 0;

    pub fn new(root: Message) -> Self {
        Self {
            nodes: vec![Node {
                msg: root,
                parent: None,
                children: Vec::new(),
                depth: 0,
            }],
        }
    }

    /// Append `msg` under `parent`. Returns `None` if `parent` is not a
    /// node of this thread.
    pub fn add_reply(&mut self, parent: NodeRef, msg: Message) -> Option<NodeRef> {
        let depth = self.nodes.get(parent)?.depth + 1;
        let idx = self.nodes.len();
        self.nodes.push(Node {
            msg,
            parent: Some(parent),
            children: Vec::new(),
            depth,
        });
        self.nodes[parent].children.push(idx);
        Some(idx)
    }

    pub fn root(&self) -> &Node {
        &self.nodes[Self::ROOT]
    }

    pub fn node(&self, r: NodeRef) -> Option<&Node> {
        self.nodes.get(r)
    }

    pub fn find(&self, id: &Id) -> Option<NodeRef> {
        self.nodes.iter().position(|n| n.msg.id() == *id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk in pre-order until the visitor says stop. Returns `Visit::Stop`
    /// if the walk was cut short.
    pub fn view<V: ViewingVisitor>(&self, visitor: &mut V) -> Visit {
        let mut stack = vec![Self::ROOT];
        while let Some(r) = stack.pop() {
            let node = &self.nodes[r];
            if visitor.visit(node) == Visit::Stop {
                return Visit::Stop;
            }
            stack.extend(node.children.iter().rev());
        }
        Visit::Continue
    }

    /// Messages in pre-order.
    pub fn messages(&self) -> Vec<&Message> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![Self::ROOT];
        while let Some(r) = stack.pop() {
            out.push(&self.nodes[r].msg);
            stack.extend(self.nodes[r].children.iter().rev());
        }
        out
    }

    /// Build the filtered tree. `None` when the root itself is pruned.
    pub fn moderate<V: ModeratingVisitor>(&self, visitor: &mut V) -> Option<Thread> {
        let root_msg = visitor.moderate(self.root())?;
        let mut out = Thread::new(root_msg);
        // (source node, destination parent)
        let mut stack: Vec<(NodeRef, NodeRef)> = self
            .root()
            .children
            .iter()
            .rev()
            .map(|c| (*c, Thread::ROOT))
            .collect();
        while let Some((src, dst_parent)) = stack.pop() {
            let node = &self.nodes[src];
            let Some(msg) = visitor.moderate(node) else {
                continue;
            };
            if let Some(dst) = out.add_reply(dst_parent, msg) {
                stack.extend(node.children.iter().rev().map(|c| (*c, dst)));
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::types::now;

    fn msg(key: &PrivateKey, subject: &str, parent: Id) -> Message {
        let topic = if parent.is_zero() {
            Some("test".parse().unwrap())
        } else {
            None
        };
        Message::emerge(key, Id::digest(b"author"), subject, "", parent, topic, now()).unwrap()
    }

    /// root
    /// ├── a
    /// │   └── a1
    /// └── b
    fn sample() -> Thread {
        let key = PrivateKey::generate();
        let root = msg(&key, "root", Id::ZERO);
        let a = msg(&key, "a", root.id());
        let a1 = msg(&key, "a1", a.id());
        let b = msg(&key, "b", root.id());
        let mut t = Thread::new(root);
        let ra = t.add_reply(Thread::ROOT, a).unwrap();
        t.add_reply(ra, a1).unwrap();
        t.add_reply(Thread::ROOT, b).unwrap();
        t
    }

    fn subjects(t: &Thread) -> Vec<String> {
        t.messages().iter().map(|m| m.subject().to_string()).collect()
    }

    #[test]
    fn test_preorder() {
        assert_eq!(subjects(&sample()), vec!["root", "a", "a1", "b"]);
    }

    #[test]
    fn test_depth_and_parent() {
        let mut t = sample();
        assert!(t.root().is_root());
        let a1 = t.node(2).unwrap();
        assert_eq!(a1.depth(), 2);
        assert_eq!(a1.parent(), Some(1));
        let orphan = t.root().message().clone();
        assert!(t.add_reply(99, orphan).is_none());
    }

    #[test]
    fn test_view_stops() {
        let t = sample();
        let mut seen = Vec::new();
        let res = t.view(&mut |n: &Node| {
            seen.push(n.message().subject().to_string());
            if n.message().subject() == "a1" {
                Visit::Stop
            } else {
                Visit::Continue
            }
        });
        assert_eq!(res, Visit::Stop);
        assert_eq!(seen, vec!["root", "a", "a1"]);
    }

    #[test]
    fn test_moderate_prunes_subtree() {
        let t = sample();
        let out = t
            .moderate(&mut |n: &Node| {
                (n.message().subject() != "a").then(|| n.message().clone())
            })
            .unwrap();
        assert_eq!(subjects(&out), vec!["root", "b"]);
        assert_eq!(out.node(1).unwrap().depth(), 1);
    }

    #[test]
    fn test_moderate_root_pruned() {
        let t = sample();
        assert!(t.moderate(&mut |_: &Node| -> Option<Message> { None }).is_none());
    }

    #[test]
    fn test_find() {
        let t = sample();
        let b_id = t.node(3).unwrap().message().id();
        assert_eq!(t.find(&b_id), Some(3));
        assert_eq!(t.find(&Id::digest(b"nope")), None);
    }
}
