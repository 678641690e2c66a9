// tests/extension_tests.rs

mod common;

use std::sync::Arc;

use common::*;
use stencil::{
    ConfigOverrides, Environment, ErrorType, ExprStmtExtension, ExtensionCatalog, ExtensionSpec,
    LoopControlsExtension, WithExtension,
};

// ---
// Built-in extensions
// ---

#[test]
fn test_loop_controls_continue() {
    let env = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    let source = "{%- for item in [1, 2, 3, 4] %}\n\
                  {%- if item % 2 == 0 %}{% continue %}{% endif -%}\n\
                  {{ item }}\n\
                  {%- endfor %}";
    assert_eq!(render(&env, source), "13");
}

#[test]
fn test_loop_controls_break() {
    let env = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    let source = "{%- for item in [1, 2, 3, 4] %}\n\
                  {%- if item > 2 %}{% break %}{% endif -%}\n\
                  {{ item }}\n\
                  {%- endfor %}";
    assert_eq!(render(&env, source), "12");
}

#[test]
fn test_do_appends_to_list() {
    let env = env_with(vec![ExtensionSpec::of::<ExprStmtExtension>()]);
    let source = "{%- set items = [] %}\n\
                  {%- for char in \"foo\" %}\n\
                  {%- do items.append(loop.index0 ~ char) %}\n\
                  {%- endfor %}{{ items|join(', ') }}";
    assert_eq!(render(&env, source), "0f, 1o, 2o");
}

#[test]
fn test_do_self_containing_list_renders_ellipsis() {
    let env = env_with(vec![ExtensionSpec::of::<ExprStmtExtension>()]);
    let source = "{% set a = [1] %}{% do a.append(a) %}{{ a }} {{ [a] }} {{ {'k': a} }} {{ a|length }}";
    assert_eq!(
        render(&env, source),
        "[1, [...]] [[1, [...]]] {'k': [1, [...]]} 2"
    );
}

#[test]
fn test_with_scopes_bindings() {
    let env = env_with(vec![ExtensionSpec::of::<WithExtension>()]);
    let template = env
        .from_string(
            "{% with a=42, b=23 -%}\n    {{ a }} = {{ b }}\n{% endwith -%}\n    {{ a }} = {{ b }}",
        )
        .unwrap();
    let rendered = template.render_with([("a", 1), ("b", 2)]).unwrap();
    let lines: Vec<&str> = rendered.lines().map(str::trim).collect();
    assert_eq!(lines, vec!["42 = 23", "1 = 2"]);
}

#[test]
fn test_with_bindings_see_outer_scope() {
    let env = env_with(vec![ExtensionSpec::of::<WithExtension>()]);
    let template = env
        .from_string("{% with a=b, b=a %}{{ a }}{{ b }}{% endwith %}{{ a }}{{ b }}")
        .unwrap();
    assert_eq!(template.render_with([("a", 1), ("b", 2)]).unwrap(), "2112");
}

// ---
// Extension-authored nodes
// ---

#[test]
fn test_extension_nodes() {
    let env = example_env();
    assert_eq!(render(&env, "{% test %}"), "False|42|23|{}");
}

#[test]
fn test_extension_nodes_observe_blocks_and_sandbox() {
    let env = Environment::builder()
        .extension::<ExampleExtension>()
        .import(IMPORTABLE, 23)
        .sandboxed(true)
        .build()
        .unwrap();
    let rendered = render(&env, "{% block body %}{% test %}{% endblock %}");
    assert_eq!(rendered, r"True|42|23|{'body': '<block \'body\'>'}");
}

#[test]
fn test_identifier_is_type_name() {
    let env = example_env();
    let extension = env.extension_of::<ExampleExtension>().unwrap();
    assert_eq!(
        extension.identifier(),
        std::any::type_name::<ExampleExtension>()
    );
    assert!(extension.identifier().ends_with("common::ExampleExtension"));
    assert!(env.extension(extension.identifier()).is_some());
}

#[test]
fn test_overlay_rebinds_extensions() {
    let env = env_with(vec![ExtensionSpec::of::<ExampleExtension>()]);
    let original = env.extension_of::<ExampleExtension>().unwrap();
    assert_eq!(original.environment(), env.id());

    let overlay = env.overlay(ConfigOverrides::new()).unwrap();
    let rebound = overlay.extension_of::<ExampleExtension>().unwrap();
    assert!(overlay.is_overlay());
    assert_eq!(overlay.linked_to(), Some(env.id()));
    assert_ne!(overlay.id(), env.id());
    assert_eq!(rebound.environment(), overlay.id());
    assert_eq!(rebound.identifier(), original.identifier());
    assert!(!Arc::ptr_eq(original, rebound));
    // The parent keeps its own instance.
    assert_eq!(original.environment(), env.id());
}

#[test]
fn test_overlay_adds_extensions_and_overrides_options() {
    let env = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    let overlay = env
        .overlay(
            ConfigOverrides::new()
                .extension::<ExprStmtExtension>()
                .sandboxed(true),
        )
        .unwrap();
    assert!(env.extension_of::<ExprStmtExtension>().is_none());
    assert!(overlay.extension_of::<ExprStmtExtension>().is_some());
    assert!(overlay.extension_of::<LoopControlsExtension>().is_some());
    assert_eq!(
        overlay.attribute("sandboxed").map(|v| v.to_string()),
        Some("True".to_string())
    );
    assert_eq!(
        env.attribute("sandboxed").map(|v| v.to_string()),
        Some("False".to_string())
    );
}

// ---
// Preprocess and stream filter hooks
// ---

#[test]
fn test_preprocessor_extension() {
    let env = env_with(vec![ExtensionSpec::of::<PreprocessorExtension>()]);
    let template = env.from_string("{[[TEST]]}").unwrap();
    assert_eq!(template.render_with([("foo", 42)]).unwrap(), "{(42)}");
}

#[test]
fn test_streamfilter_extension() {
    let env = env_with(vec![ExtensionSpec::of::<StreamFilterExtension>()]);
    let template = env.from_string("Foo _(bar) Baz").unwrap();
    let rendered = template.render_with([("gettext", upper_gettext())]).unwrap();
    assert_eq!(rendered, "Foo BAR Baz");
}

#[test]
fn test_streamfilter_multiline_keeps_lines() {
    let env = env_with(vec![ExtensionSpec::of::<StreamFilterExtension>()]);
    let tokens = tokens(&env, "one\ntwo _(three)\nfour _(five)");
    let names: Vec<u32> = tokens
        .iter()
        .filter(|t| t.is_name("gettext"))
        .map(|t| t.line)
        .collect();
    assert_eq!(names, vec![2, 3]);
    assert!(tokens.windows(2).all(|w| w[0].line <= w[1].line));
}

#[test]
fn test_noop_extension_changes_nothing() {
    let source = "{% for x in [1, 2] %}<{{ x }}>{% endfor %}{% block b %}!{% endblock %}";
    let plain = Environment::builder().build().unwrap();
    let with_noop = env_with(vec![ExtensionSpec::of::<NoopExtension>()]);
    assert_eq!(tokens(&plain, source), tokens(&with_noop, source));
    assert_eq!(render(&plain, source), render(&with_noop, source));
}

// ---
// Determinism
// ---

#[test]
fn test_compile_is_deterministic_across_environments() {
    let source = "{% for i in [1, 2, 3] %}{% if i > 1 %}{% break %}{% endif %}{{ i|string }}{% endfor %}\
                  {% block tail %}{{ i }}{% endblock %}";
    let first = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    let second = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    let a = first.compile(source, Some("det"), None).unwrap();
    let b = second.compile(source, Some("det"), None).unwrap();
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.digest().len(), 64);
}

// ---
// Errors
// ---

#[test]
fn test_extension_runtime_error_carries_location() {
    let env = env_with(vec![ExtensionSpec::of::<FailingExtension>()]);
    let template = env.from_source("line one\n{% explode %}", "boom.html").unwrap();
    let err = template.render().unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Runtime);
    assert_eq!(err.line(), Some(2));
    assert_eq!(err.template_name(), Some("boom.html"));
    assert!(err.message().contains("exploded"));
}

#[test]
fn test_preprocess_error_aborts_compile() {
    let env = env_with(vec![ExtensionSpec::of::<FailingExtension>()]);
    let err = env
        .compile("hello [[fail]]", Some("pre.html"), None)
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Preprocess);
    assert_eq!(err.template_name(), Some("pre.html"));
}

#[test]
fn test_tag_collision_is_configuration_error() {
    let err = Environment::builder()
        .extension::<WithExtension>()
        .extension::<ShadowWithExtension>()
        .build()
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Configuration);
    assert!(err.message().contains("'with'"));
}

#[test]
fn test_duplicate_extension_is_kept_once() {
    let env = env_with(vec![
        ExtensionSpec::of::<WithExtension>(),
        ExtensionSpec::of::<WithExtension>(),
    ]);
    assert_eq!(env.extensions().len(), 1);
}

#[test]
fn test_catalog_resolves_aliases() {
    let catalog = ExtensionCatalog::builtin();
    assert!(catalog.contains("loopcontrols"));
    assert_eq!(
        catalog.resolve("do").unwrap().identifier(),
        stencil::extensions::identifier_of::<ExprStmtExtension>()
    );

    let env = Environment::builder()
        .extension_name("loopcontrols")
        .extension_name("with")
        .build()
        .unwrap();
    assert_eq!(env.extensions().len(), 2);
    assert!(env.extension_of::<LoopControlsExtension>().is_some());
}

#[test]
fn test_unknown_extension_name() {
    let err = Environment::builder()
        .extension_name("i18n")
        .build()
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Configuration);
    assert!(err.message().contains("unknown extension 'i18n'"));
}
