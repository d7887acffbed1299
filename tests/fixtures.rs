#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Once;

use mantle::{Context, TemplateLookup, TemplateOptions};
use rand::Rng;

static INIT: Once = Once::new();

/// Routes the crate's log output to the test harness, once per binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .with_target(false)
            .init();
    });
}

/// A lookup holding a small site: a base layout, a section layout that
/// inherits from it, a page at the bottom of the chain and a tag library.
pub fn get_site() -> TemplateLookup {
    get_site_with(TemplateOptions::default())
}

pub fn get_site_with(options: TemplateOptions) -> TemplateLookup {
    let lookup = TemplateLookup::builder().options(options).build();
    lookup
        .put_string(
            "/base.html",
            "<html><%block name=\"title\">Site</%block>|${self.header()}|${next.body()}</html>\
             <%def name=\"header()\">base-header</%def>",
        )
        .unwrap();
    lookup
        .put_string(
            "/section.html",
            "<%inherit file=\"base.html\"/>[${next.body()}]\
             <%def name=\"header()\">section-header+${parent.header()}</%def>",
        )
        .unwrap();
    lookup
        .put_string(
            "/page.html",
            "<%inherit file=\"section.html\"/><%block name=\"title\">${heading}</%block>page ${name}",
        )
        .unwrap();
    lookup
        .put_string(
            "/tags.html",
            "<%def name=\"bold(text)\"><b>${text}</b></%def>\
             <%def name=\"panel(title)\"><div>${title}:${caller.body()}</div></%def>",
        )
        .unwrap();
    lookup
}

pub fn context<I, V>(entries: I) -> Context
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<mantle::Value>,
{
    entries.into_iter().collect()
}

pub fn generate_random_whitespace() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(0..10);
    (0..length).map(|_| ' ').collect()
}

pub fn generate_random_whitespace_at_least_one() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(1..10);
    (0..length).map(|_| ' ').collect()
}
