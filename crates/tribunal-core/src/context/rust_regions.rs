//! Locates Rust test code with `syn`.

use std::ops::RangeInclusive;
use syn::spanned::Spanned;
use syn::visit::Visit;
use syn::{ImplItemFn, ItemFn, ItemImpl, ItemMod};
use tracing::debug;

use crate::utils::attributes::{has_cfg_test, has_test_attr};

/// Returns the 1-indexed line ranges of `#[cfg(test)]` items and test functions.
///
/// Sources that do not parse yield no regions.
#[must_use]
pub fn test_regions(content: &str) -> Vec<RangeInclusive<usize>> {
    let file = match syn::parse_file(content) {
        Ok(file) => file,
        Err(e) => {
            debug!(error = %e, "Rust source did not parse; no test regions");
            return Vec::new();
        }
    };
    let mut visitor = TestRegionVisitor::default();
    visitor.visit_file(&file);
    visitor.regions
}

#[derive(Default)]
struct TestRegionVisitor {
    regions: Vec<RangeInclusive<usize>>,
}

impl TestRegionVisitor {
    fn record(&mut self, node: &impl Spanned) {
        let span = node.span();
        self.regions.push(span.start().line..=span.end().line);
    }
}

impl<'ast> Visit<'ast> for TestRegionVisitor {
    fn visit_item_mod(&mut self, node: &'ast ItemMod) {
        if has_cfg_test(&node.attrs) {
            self.record(node);
            return;
        }
        syn::visit::visit_item_mod(self, node);
    }

    fn visit_item_fn(&mut self, node: &'ast ItemFn) {
        if has_test_attr(&node.attrs) || has_cfg_test(&node.attrs) {
            self.record(node);
            return;
        }
        syn::visit::visit_item_fn(self, node);
    }

    fn visit_item_impl(&mut self, node: &'ast ItemImpl) {
        if has_cfg_test(&node.attrs) {
            self.record(node);
            return;
        }
        syn::visit::visit_item_impl(self, node);
    }

    fn visit_impl_item_fn(&mut self, node: &'ast ImplItemFn) {
        if has_cfg_test(&node.attrs) {
            self.record(node);
            return;
        }
        syn::visit::visit_impl_item_fn(self, node);
    }
}
