mod fixtures;

use std::{
    fs,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use fixtures::{
    context, generate_random_whitespace, generate_random_whitespace_at_least_one, get_site,
    get_site_with, init_tracing,
};
use mantle::{
    Context, MantleError, NativeModule, SyntaxErrorKind, Template, TemplateCollection,
    TemplateLookup, TemplateOptions, Value,
};

#[test]
#[ntest::timeout(100)]
fn test_basic_substitution() {
    let template = Template::new(format!(
        "Hello, ${{{}name{}}}!",
        generate_random_whitespace(),
        generate_random_whitespace()
    ))
    .unwrap();

    let rendered = template
        .render(&context([("name", "Jessica")]))
        .unwrap();
    assert_eq!(
        rendered, "Hello, Jessica!",
        "Rendered string should match the template."
    );
}

#[test]
#[ntest::timeout(100)]
fn test_basic_iteration() {
    let source = format!(
        "{}% for{}cat{}in{}cats:\nGreetings ${{cat}}\n{}% endfor\n",
        generate_random_whitespace(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace(),
    );
    dbg!(&source);

    let template = Template::new(source).unwrap();
    let undeclared = template.undeclared_identifiers();
    assert!(undeclared.contains("cats"));
    assert!(!undeclared.contains("cat"));

    let mut data = Context::new();
    data.insert("cats", vec!["Fluffy", "Whiskers"]);
    assert_eq!(
        template.render(&data).unwrap(),
        "Greetings Fluffy\nGreetings Whiskers\n"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_conditionals_and_while() {
    let template = Template::new(
        "% if n > 2:\nbig\n% elif n > 0:\nsmall\n% else:\nnone\n% endif\n\
         <% i = 0 %>\\\n% while i < n:\n<% i += 1 %>\\\n% if i == 2:\n% continue\n% endif\n${i}\n% endwhile\n",
    )
    .unwrap();

    assert_eq!(template.render(&context([("n", 3)])).unwrap(), "big\n1\n3\n");
    assert_eq!(template.render(&context([("n", 1)])).unwrap(), "small\n1\n");
    assert_eq!(template.render(&context([("n", 0)])).unwrap(), "none\n");
}

#[test]
#[ntest::timeout(100)]
fn test_comments_text_and_doc_are_not_rendered() {
    let template = Template::new(
        "## a comment\n<%doc>\n  ${not_rendered}\n</%doc><%text>${raw} <%def></%text>",
    )
    .unwrap();
    assert_eq!(
        template.render(&Context::new()).unwrap(),
        "${raw} <%def>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_filters() {
    let template = Template::new(
        "${markup | h} ${'  x  ' | trim} ${'a b&c' | u} ${markup | x}\
         <%def name=\"shout()\" filter=\"trim\">  loud  </%def>|${shout()}|",
    )
    .unwrap();
    let rendered = template
        .render(&context([("markup", "<a href='x'>")]))
        .unwrap();
    assert_eq!(
        rendered,
        "&lt;a href=&#39;x&#39;&gt; x a+b%26c &lt;a href=&#39;x&#39;&gt;|loud|"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_default_filters_can_be_disabled_per_expression() {
    let template = Template::with_options(
        "${markup} ${markup | n}",
        "memory:defaults",
        TemplateOptions::new().default_filters(["h"]),
    )
    .unwrap();
    assert_eq!(
        template.render(&context([("markup", "<i>")])).unwrap(),
        "&lt;i&gt; <i>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_three_level_inheritance() {
    let lookup = get_site();
    let data = context([("heading", "Home"), ("name", "ada")]);
    assert_eq!(
        lookup.render("/page.html", &data).unwrap(),
        "<html>Home|section-header+base-header|[page ada]</html>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_inheritance_cycle_is_reported() {
    let lookup = TemplateLookup::new();
    lookup.put_string("/a.html", "<%inherit file=\"b.html\"/>a").unwrap();
    lookup.put_string("/b.html", "<%inherit file=\"a.html\"/>b").unwrap();

    let err = lookup.render("/a.html", &Context::new()).unwrap_err();
    assert!(
        matches!(err.root_cause(), MantleError::InheritanceCycle { uri } if uri == "/a.html"),
        "{err:?}"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_inheriting_without_a_lookup_fails() {
    let template = Template::new("<%inherit file=\"base.html\"/>x").unwrap();
    let err = template.render(&Context::new()).unwrap_err();
    assert!(
        matches!(err.root_cause(), MantleError::NoLookup { target, .. } if target == "base.html"),
        "{err:?}"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_file_namespace_and_custom_tag() {
    let lookup = get_site();
    lookup
        .put_string(
            "/uses_tags.html",
            "<%namespace name=\"tags\" file=\"tags.html\"/>\
             ${tags.bold('x')}<%tags:panel title=\"T\">inside ${n}</%tags:panel>",
        )
        .unwrap();
    assert_eq!(
        lookup.render("/uses_tags.html", &context([("n", 1)])).unwrap(),
        "<b>x</b><div>T:inside 1</div>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_namespace_import_brings_names_into_scope() {
    let lookup = get_site();
    lookup
        .put_string(
            "/imports.html",
            "<%namespace name=\"tags\" file=\"/tags.html\" import=\"bold\"/>${bold('y')}",
        )
        .unwrap();
    assert_eq!(
        lookup.render("/imports.html", &Context::new()).unwrap(),
        "<b>y</b>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_include_passes_keyword_arguments() {
    let lookup = TemplateLookup::new();
    lookup
        .put_string(
            "/item.html",
            "<%page args=\"label, count=1\"/>${label}x${count};",
        )
        .unwrap();
    lookup
        .put_string(
            "/list.html",
            "<%include file=\"item.html\" args=\"label='a'\"/>\
             <%include file=\"item.html\" args=\"label='b', count=3\"/>",
        )
        .unwrap();
    assert_eq!(
        lookup.render("/list.html", &Context::new()).unwrap(),
        "ax1;bx3;"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_native_modules() {
    let helpers = NativeModule::new("helpers").function("shout", |args, _| {
        let text = args.first().map(ToString::to_string).unwrap_or_default();
        Ok(Value::from(text.to_uppercase()))
    });
    let options = TemplateOptions::new().module(helpers);
    let template = Template::with_options(
        "<%! import helpers %><%namespace name=\"h\" module=\"helpers\"/>\
         ${helpers.shout('a')} ${h.shout('b')}",
        "memory:modules",
        options,
    )
    .unwrap();
    assert_eq!(template.render(&Context::new()).unwrap(), "A B");

    let err = Template::new("<%! import missing %>x")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();
    assert!(matches!(err.root_cause(), MantleError::Import { module } if module == "missing"));
}

#[test]
#[ntest::timeout(100)]
fn test_nested_call_tags_keep_their_callers() {
    let template = Template::new(
        "<%def name=\"outer()\">(${caller.body()})</%def>\
         <%def name=\"inner()\">[${caller.body()}]</%def>\
         <%call expr=\"outer()\"><%call expr=\"inner()\">x</%call></%call>",
    )
    .unwrap();
    assert_eq!(template.render(&Context::new()).unwrap(), "([x])");
}

#[test]
#[ntest::timeout(100)]
fn test_context_object() {
    let template = Template::new(
        "${context.get('name')} ${context.get('missing', 'fallback')} ${context.has('name')}<% context.write('!') %>",
    )
    .unwrap();
    assert_eq!(
        template.render(&context([("name", "ada")])).unwrap(),
        "ada fallback True!"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_undefined_names_fail_when_rendered() {
    let template = Template::new("[${missing}]").unwrap();
    let err = template.render(&Context::new()).unwrap_err();
    assert_eq!(err.root_cause().exception_name(), "NameError");

    let lazy = Template::new(
        "${missing is UNDEFINED} ${bool(missing)} ${'set' if missing else 'unset'}",
    )
    .unwrap();
    assert_eq!(lazy.render(&Context::new()).unwrap(), "True False unset");

    let strict = Template::with_options(
        "${missing is UNDEFINED}",
        "memory:strict",
        TemplateOptions::new().strict_undefined(true),
    )
    .unwrap();
    let err = strict.render(&Context::new()).unwrap_err();
    assert_eq!(err.root_cause().exception_name(), "NameError");
}

#[test]
#[ntest::timeout(100)]
fn test_exceptions_propagate_through_defs_to_try() {
    let template = Template::new(
        "<%def name=\"lookup(key)\">${data[key]}</%def>\n\
         % try:\n${lookup('missing')}\n% except LookupError:\nno key\n% endtry\n",
    )
    .unwrap();
    let mut data = Context::new();
    data.insert("data", Value::dict([("present", 1)]));
    assert_eq!(template.render(&data).unwrap(), "\nno key\n");
}

#[test]
#[ntest::timeout(100)]
fn test_syntax_errors_carry_position() {
    let err = Template::new("ok\n  <%block name=\"a\">\nbody").unwrap_err();
    match err {
        MantleError::Syntax(err) => {
            assert_eq!(err.kind, SyntaxErrorKind::UnclosedTag("block".to_string()));
            assert_eq!((err.line, err.column), (2, 3));
        }
        other => panic!("expected a syntax error, got {other:?}"),
    }

    let err = Template::new("<%nope/>").unwrap_err();
    assert!(matches!(err, MantleError::Syntax(_)), "{err:?}");
}

#[test]
#[ntest::timeout(100)]
fn test_error_handler_applies_to_lookup_templates() {
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&handled);
    let options = TemplateOptions::new().error_handler(move |ctx, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        ctx.write("<error>");
        true
    });
    let lookup = get_site_with(options);
    lookup
        .put_string("/broken.html", "<%inherit file=\"base.html\"/>${1 // 0}")
        .unwrap();

    let rendered = lookup.render("/broken.html", &Context::new()).unwrap();
    assert!(rendered.ends_with("<error>"), "{rendered}");
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
#[ntest::timeout(100)]
fn test_cached_block_renders_once_per_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let tick = mantle::NativeFunction::new("tick", move |_, _| {
        Ok(Value::from(counter.fetch_add(1, Ordering::SeqCst)))
    });

    let template = Template::new(
        "<%block name=\"stamp\" cached=\"True\" cache_key=\"${key}\">${tick()}</%block>",
    )
    .unwrap();

    let mut first = context([("key", "a")]);
    first.insert("tick", tick.clone());
    let mut second = context([("key", "b")]);
    second.insert("tick", tick);

    assert_eq!(template.render(&first).unwrap(), "0");
    assert_eq!(template.render(&first).unwrap(), "0");
    assert_eq!(template.render(&second).unwrap(), "1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
#[ntest::timeout(100)]
fn test_cached_def_runs_once_per_render_and_invalidates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let tick = mantle::NativeFunction::new("tick", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::None)
    });

    let lookup = get_site();
    lookup
        .put_string(
            "/cached.html",
            "<%def name=\"foo()\" cached=\"True\"><% tick() %>hi</%def>${foo()} ${foo()}",
        )
        .unwrap();
    let mut data = Context::new();
    data.insert("tick", tick);

    assert_eq!(lookup.render("/cached.html", &data).unwrap(), "hi hi");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(lookup.render("/cached.html", &data).unwrap(), "hi hi");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let template = lookup.get_template("/cached.html").unwrap();
    assert_eq!(template.cache().get("render_foo").unwrap().as_deref(), Some("hi"));
    template.cache().invalidate_def("foo").unwrap();
    assert_eq!(template.cache().get("render_foo").unwrap(), None);
    assert_eq!(lookup.render("/cached.html", &data).unwrap(), "hi hi");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
#[ntest::timeout(2000)]
fn test_concurrent_renders_share_compiled_templates() {
    init_tracing();
    let lookup = get_site();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let lookup = lookup.clone();
            thread::spawn(move || {
                let mut data = Context::new();
                data.insert("heading", format!("T{i}")).insert("name", i);
                let template = lookup.get_template("/page.html").unwrap();
                (template, lookup.render("/page.html", &data).unwrap())
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    for (i, (template, rendered)) in results.iter().enumerate() {
        assert!(template.ptr_eq(&results[0].0));
        assert_eq!(
            rendered,
            &format!("<html>T{i}|section-header+base-header|[page {i}]</html>")
        );
    }
}

#[test]
#[ntest::timeout(2000)]
fn test_file_templates_inherit_across_directories() {
    init_tracing();
    let layouts = tempfile::tempdir().unwrap();
    let pages = tempfile::tempdir().unwrap();
    fs::write(
        layouts.path().join("layout.html"),
        "<main>${next.body()}</main>",
    )
    .unwrap();
    fs::create_dir(pages.path().join("blog")).unwrap();
    fs::write(
        pages.path().join("blog").join("post.html"),
        "<%inherit file=\"/layout.html\"/>${post | h}",
    )
    .unwrap();

    let lookup = TemplateLookup::builder()
        .directories([layouts.path(), pages.path()])
        .build();
    assert!(lookup.has_template("/blog/post.html"));
    assert!(!lookup.has_template("/blog/missing.html"));
    assert_eq!(
        lookup
            .render("blog/post.html", &context([("post", "a<b")]))
            .unwrap(),
        "<main>a&lt;b</main>"
    );
    assert_eq!(lookup.len(), 2);
}
