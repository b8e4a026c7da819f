use std::ops::Range;

use crate::error::{Error, ScopeTreeResult};
use crate::grammars::BASE_ROOT_RULE_REF;
use crate::node::Node;
use crate::options::Budget;
use crate::parser::cache::text_version;
use crate::parser::engine::{Engine, Scanner};
use crate::parser::stack::StackFrame;

/// A replacement of `old_len` bytes at `start` by `new_len` bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TextEdit {
    pub start: usize,
    pub old_len: usize,
    pub new_len: usize,
}

impl TextEdit {
    pub fn new(start: usize, old_len: usize, new_len: usize) -> Self {
        Self {
            start,
            old_len,
            new_len,
        }
    }

    /// End of the replaced range, in the text before the edit
    pub fn old_end(&self) -> usize {
        self.start + self.old_len
    }

    /// End of the inserted text, in the text after the edit
    pub fn new_end(&self) -> usize {
        self.start + self.new_len
    }

    pub fn delta(&self) -> isize {
        self.new_len as isize - self.old_len as isize
    }

    /// Moves a position of the old text after the edit, `None` for positions inside the
    /// replaced range.
    fn shifted(&self, pos: usize) -> Option<usize> {
        if pos < self.start {
            Some(pos)
        } else if pos >= self.old_end() {
            pos.checked_add_signed(self.delta())
        } else {
            None
        }
    }

    /// Positions of the old text that a start position of the new text may come from
    fn old_starts(&self, pos: usize) -> impl Iterator<Item = usize> {
        let before = (pos <= self.start).then_some(pos);
        let after = (pos >= self.new_end())
            .then(|| pos.checked_add_signed(-self.delta()))
            .flatten();
        before.into_iter().chain(after.filter(|p| Some(*p) != before))
    }

    /// Whether `range` of the old text overlaps the replaced range, or `range` of the new text
    /// overlaps the inserted text
    fn touches(&self, old: Range<usize>, new: Range<usize>) -> bool {
        (old.start < self.old_end() && old.end > self.start)
            || (new.start < self.new_end() && new.end > self.start)
    }
}

/// Brings `root`, the tree of the text before `edit`, up to date with `text`, the text after
/// it. The result is the tree a full parse of `text` gives.
///
/// The text is scanned again from the start of the root. After each step the scan state is
/// compared with the old tree: once a node ends after the edit at a position the old scan
/// also reached with the same blocks open, everything the old scan did from there is
/// reused, shifted by the edit. A block around the edit that ends at the same place as
/// before is therefore the only part rebuilt beyond the prefix, and otherwise its ancestors
/// are rebuilt until one of them lines up again.
///
/// If the budget runs out, `root` holds a partial tree and the error tells where the scan
/// stopped.
pub(crate) fn update_children(
    root: &mut Node,
    edit: &TextEdit,
    engine: &mut Engine,
    text: &str,
    budget: &mut Budget,
) -> ScopeTreeResult<()> {
    let version = text_version(text);
    let start = root.region.start;
    let frame = StackFrame::root(
        BASE_ROOT_RULE_REF,
        Node::new(root.name.clone(), start..text.len()),
    );
    let mut scanner = Scanner::new(text, version, start, frame);

    loop {
        if !budget.step() {
            let parsed_up_to = scanner.pos;
            let mut partial = engine.finish(scanner, parsed_up_to);
            partial.region = start..text.len();
            *root = partial;
            return Err(Error::ParseIncomplete { parsed_up_to });
        }
        if !engine.step(&mut scanner) {
            break;
        }
        if let Some(path) = synced_path(root, &scanner, edit) {
            #[cfg(feature = "debug")]
            log::debug!(
                "[update_children] Back in sync at {} with {} open blocks",
                scanner.pos,
                scanner.stack.frames.len() - 1
            );
            let updated = reuse_old_tail(scanner, root, &path, edit);
            *root = updated;
            return Ok(());
        }
    }

    let mut updated = engine.finish(scanner, text.len());
    updated.region = start..text.len();
    *root = updated;
    Ok(())
}

/// The node the scan finished last: the last child of the innermost open block, if the scan
/// is right at its end. The captures of a begin delimiter are not scan steps.
fn last_finished<'a>(scanner: &'a Scanner) -> Option<&'a Node> {
    let top = scanner.stack.top();
    let container = top.content.as_ref().unwrap_or(&top.node);
    container.children.last().filter(|node| {
        node.region.end == scanner.pos && node.region.start >= top.enter_position
    })
}

/// Finds the point of the old scan with the same state as the current one: the same blocks
/// open and a node just finished after the edit, at the same place once shifted. Returns
/// the child indices leading to that node in the old tree, going through the blocks and
/// their content wrappers.
fn synced_path(old_root: &Node, scanner: &Scanner, edit: &TextEdit) -> Option<Vec<usize>> {
    let node = last_finished(scanner)?;
    if node.region.end < edit.new_end() {
        return None;
    }
    let old_end = node.region.end.checked_add_signed(-edit.delta())?;

    let mut path = Vec::new();
    let mut container = old_root;
    for frame in &scanner.stack.frames[1..] {
        let info = frame.node.block?;
        if info.end_outside_begin {
            return None;
        }
        let new_begin = frame.node.region.start..frame.node.region.start + info.begin_len;
        let (index, block) = edit.old_starts(new_begin.start).find_map(|old_start| {
            let index = container
                .children
                .binary_search_by_key(&old_start, |c| c.region.start)
                .ok()?;
            let block = &container.children[index];
            let old_info = block.block?;
            let old_begin = old_start..old_start + old_info.begin_len;
            // the end regex may depend on the text of the begin delimiter
            let same = old_info.rule == info.rule
                && old_info.begin_len == info.begin_len
                && !edit.touches(old_begin, new_begin.clone());
            same.then_some((index, block))
        })?;
        path.push(index);
        container = block;

        if let Some(content) = &frame.content {
            let index = edit.old_starts(content.region.start).find_map(|old_start| {
                container
                    .children
                    .binary_search_by_key(&old_start, |c| c.region.start)
                    .ok()
                    .filter(|&i| {
                        let wrapper = &container.children[i];
                        !wrapper.is_block() && wrapper.name == content.name
                    })
            })?;
            path.push(index);
            container = &container.children[index];
        }
    }

    let index = container
        .children
        .binary_search_by_key(&old_end, |c| c.region.end)
        .ok()?;
    // captures of the block delimiters are not scan steps, only nodes of the content are
    if let Some(content) = container.content_region() {
        let old = &container.children[index];
        if old.region.start < content.start || old.region.end > content.end {
            return None;
        }
    }
    path.push(index);
    Some(path)
}

/// Completes the current scan with what the old scan produced after the synced node at
/// `path`: the following siblings at every level, shifted by the edit, and the old ends of
/// the open blocks.
fn reuse_old_tail(scanner: Scanner, old_root: &Node, path: &[usize], edit: &TextEdit) -> Node {
    let shift = |node: &Node| {
        let mut node = node.clone();
        node.adjust(edit.start, edit.delta());
        node
    };
    // only called with positions after the edit
    let shift_pos = |pos: usize| edit.shifted(pos).unwrap_or(pos);

    // The old nodes from the root down to the synced one
    let mut olds = vec![old_root];
    for &index in path {
        let parent: &Node = olds[olds.len() - 1];
        olds.push(&parent.children[index]);
    }

    let text_len = scanner.text.len();
    let mut frames = scanner.stack.frames;
    // `olds[level]` is the old counterpart of the last node of the current container
    let mut level = path.len();
    let mut closed: Option<Node> = None;
    while let Some(mut frame) = frames.pop() {
        if let Some(node) = closed.take() {
            frame.push_child(node);
        }
        for node in &olds[level - 1].children[path[level - 1] + 1..] {
            frame.push_child(shift(node));
        }
        level -= 1;

        if frame.rule_ref.is_none() {
            frame.node.region.end = text_len;
            return frame.node;
        }
        if let Some(mut content) = frame.content.take() {
            content.region.end = shift_pos(olds[level].region.end);
            if !content.is_empty() {
                frame.node.children.push(content);
            }
            level -= 1;
            // the end delimiter captures
            for node in &olds[level].children[path[level] + 1..] {
                frame.node.children.push(shift(node));
            }
        }
        let block = olds[level];
        frame.node.region.end = shift_pos(block.region.end);
        if let (Some(info), Some(old_info)) = (frame.node.block.as_mut(), block.block) {
            info.end_len = old_info.end_len;
        }
        closed = Some(frame.node);
    }
    closed.unwrap_or_else(|| Node::new("", 0..text_len))
}
