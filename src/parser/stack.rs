use std::fmt;

use crate::grammars::{GlobalRuleRef, RegexId};
use crate::node::Node;

/// How the block of a frame is closed
pub(crate) enum EndRegex {
    /// The root frame only ends with the text
    None,
    /// The end regex of the rule, compiled with the grammar
    Fixed(RegexId),
    /// End regex with its back-references filled by the begin captures
    Resolved {
        pattern: String,
        regex: Box<onig::Regex>,
    },
    /// Invalid regex or back-reference to a group that did not capture anything:
    /// the block runs until the end of the region
    Never,
}

impl fmt::Debug for EndRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndRegex::None => write!(f, "none"),
            EndRegex::Fixed(id) => write!(f, "fixed({})", id.as_index()),
            EndRegex::Resolved { pattern, .. } => write!(f, "resolved({pattern:?})"),
            EndRegex::Never => write!(f, "never"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StackFrame {
    /// The begin/end rule that pushed this frame, `None` for the root frame
    pub rule_ref: Option<GlobalRuleRef>,
    /// The rule whose nested patterns are searched while this frame is on top
    pub patterns: GlobalRuleRef,
    pub end: EndRegex,
    /// The block node being built. Its end is only known once the frame is popped.
    pub node: Node,
    /// The `contentName` wrapper, receiving the children matched inside the block
    pub content: Option<Node>,
    /// Where the begin match ended (for infinite loop detection)
    pub enter_position: usize,
}

impl StackFrame {
    pub fn root(patterns: GlobalRuleRef, node: Node) -> Self {
        let enter_position = node.region.start;
        Self {
            rule_ref: None,
            patterns,
            end: EndRegex::None,
            node,
            content: None,
            enter_position,
        }
    }

    /// Attaches a finished node to the block being built
    pub fn push_child(&mut self, node: Node) {
        match &mut self.content {
            Some(content) => content.children.push(node),
            None => self.node.children.push(node),
        }
    }
}

/// The blocks currently open, from the root to the innermost one.
pub(crate) struct StateStack {
    pub frames: Vec<StackFrame>,
}

impl StateStack {
    pub fn new(root: StackFrame) -> Self {
        Self {
            frames: vec![root],
        }
    }

    /// Called when the begin regex of a begin/end rule matches
    pub fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    /// Exits the current block, never popping the root frame
    pub fn pop(&mut self) -> Option<StackFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    pub fn top(&self) -> &StackFrame {
        self.frames.last().expect("stack never empty")
    }

    pub fn top_mut(&mut self) -> &mut StackFrame {
        self.frames.last_mut().expect("stack never empty")
    }

    /// Whether `rule_ref` was already entered at `pos` without consuming anything since.
    /// Entering it again would loop forever.
    pub fn is_reentry(&self, rule_ref: GlobalRuleRef, pos: usize) -> bool {
        self.frames
            .iter()
            .any(|f| f.rule_ref == Some(rule_ref) && f.enter_position == pos)
    }
}

impl fmt::Debug for StateStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StateStack:")?;

        for (depth, frame) in self.frames.iter().enumerate() {
            let indent = "  ".repeat(depth);
            match frame.rule_ref {
                Some(r) => write!(f, "{indent}grammar={}, rule={}", r.grammar.0, r.rule.0)?,
                None => write!(f, "{indent}root")?,
            }
            if !frame.node.name.is_empty() {
                write!(f, " name={:?}", frame.node.name)?;
            }
            if let Some(content) = &frame.content {
                write!(f, ", content={:?}", content.name)?;
            }
            write!(
                f,
                ", start={}, enter_pos={}, end={:?}",
                frame.node.region.start, frame.enter_position, frame.end
            )?;
            writeln!(f)?;
        }

        Ok(())
    }
}
