use crate::grammars::RawGrammar;
use crate::node::Node;
use crate::registry::Registry;

pub(crate) fn get_registry() -> Registry {
    Registry::from_dir("testdata/grammars").unwrap()
}

/// A registry holding only the given JSON grammar
pub(crate) fn registry_with(json: &str) -> Registry {
    let raw: RawGrammar = serde_json::from_str(json).unwrap();
    let mut registry = Registry::new();
    registry.add_grammar(raw.compile());
    registry
}

/// Checks that every node is inside its parent and that siblings are sorted and disjoint
pub(crate) fn assert_well_formed(node: &Node) {
    let mut prev_end = node.region.start;
    for child in &node.children {
        assert!(
            child.region.start >= prev_end && child.region.end <= node.region.end,
            "{:?} {:?} misplaced in {:?} {:?}",
            child.name,
            child.region,
            node.name,
            node.region
        );
        assert!(child.region.start <= child.region.end);
        prev_end = child.region.end;
        assert_well_formed(child);
    }
}
