// tests/runtime_tests.rs

mod common;

use common::*;
use serde_json::json;
use stencil::{Environment, ErrorType, Value};

fn plain() -> Environment {
    Environment::builder().build().unwrap()
}

// ---
// Extension-visible state
// ---

#[test]
fn test_attribute_set_after_compile_is_observed() {
    let env = example_env();
    let template = env.from_string("{% test %}").unwrap();
    assert_eq!(template.render().unwrap(), "False|42|23|{}");

    env.set_attribute("sandboxed", true);
    assert_eq!(template.render().unwrap(), "True|42|23|{}");
}

#[test]
fn test_import_is_resolved_at_compile_time() {
    let env = Environment::builder()
        .extension::<ExampleExtension>()
        .build()
        .unwrap();
    let err = env
        .compile("\n\n{% test %}", Some("imports.html"), None)
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Import);
    assert!(err.message().contains("could not import 'tests.importable_object'"));
    assert_eq!(err.line(), Some(3));
    assert_eq!(err.template_name(), Some("imports.html"));
}

#[test]
fn test_custom_attributes_are_readable() {
    let env = Environment::builder()
        .attribute("site", "Example")
        .build()
        .unwrap();
    assert_eq!(env.attribute("site"), Some(Value::from("Example")));
    assert_eq!(env.attribute("trim_blocks"), Some(Value::Bool(false)));
}

// ---
// Expressions and statements
// ---

#[test]
fn test_builtin_filters() {
    let env = plain();
    assert_eq!(
        render(&env, "{{ 'abc'|upper }}{{ [1, 2, 3]|length }}{{ missing|default('d') }}"),
        "ABC3d"
    );
    assert_eq!(render(&env, "{{ [1, 2, 3]|reverse|join('') }}"), "321");
}

#[test]
fn test_unknown_filter_fails_at_compile_time() {
    let err = plain().compile("{{ x|shout }}", None, None).unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Syntax);
    assert!(err.message().contains("no filter named 'shout'"));
}

#[test]
fn test_custom_filters_and_functions() {
    let env = Environment::builder()
        .filter("twice", |value, _args| {
            Ok(Value::String(format!("{0}{0}", value)))
        })
        .function("greet", |args| {
            Ok(Value::String(format!("hi {}", args[0])))
        })
        .build()
        .unwrap();
    assert_eq!(render(&env, "{{ greet('bob')|twice }}"), "hi bobhi bob");
}

#[test]
fn test_string_and_map_methods() {
    let env = plain();
    assert_eq!(render(&env, "{{ 'a,b'.split(',')|join('-') }}"), "a-b");
    assert_eq!(render(&env, "{{ {'k': 1}.get('k') }}{{ {'k': 1}.get('z', 0) }}"), "10");
    assert_eq!(render(&env, "{{ ' x '.strip() ~ 'y'.upper() }}"), "xY");
}

#[test]
fn test_loop_variables() {
    let env = plain();
    let rendered = render(
        &env,
        "{% for x in 'ab' %}{{ loop.index }}{{ loop.revindex }}{{ loop.first }}{{ loop.last }} {% endfor %}",
    );
    assert_eq!(rendered, "12TrueFalse 21FalseTrue ");
}

#[test]
fn test_for_else_runs_on_empty() {
    let env = plain();
    assert_eq!(render(&env, "{% for x in [] %}x{% else %}empty{% endfor %}"), "empty");
    assert_eq!(render(&env, "{% for x in [1] %}x{% else %}empty{% endfor %}"), "x");
}

#[test]
fn test_loop_assignments_do_not_leak() {
    let env = plain();
    let rendered = render(
        &env,
        "{% set y = 1 %}{% for x in [1, 2] %}{% set y = x * 10 %}{{ y }},{% endfor %}{{ y }}{{ x }}",
    );
    assert_eq!(rendered, "10,20,1");
}

#[test]
fn test_tuple_unpacking() {
    let env = plain();
    let template = env
        .from_string("{% for k, v in pairs %}{{ k }}={{ v }};{% endfor %}")
        .unwrap();
    let rendered = template
        .render_json(json!({"pairs": [["a", 1], ["b", 2]]}))
        .unwrap();
    assert_eq!(rendered, "a=1;b=2;");
}

#[test]
fn test_undefined_renders_empty() {
    let env = plain();
    assert_eq!(render(&env, "[{{ nothing }}][{{ nothing.deeper }}]"), "[][]");
}

#[test]
fn test_range_global() {
    assert_eq!(render(&plain(), "{% for i in range(3) %}{{ i }}{% endfor %}"), "012");
}

#[test]
fn test_range_bounds() {
    let env = plain();
    let each = |args: &str| render(&env, &format!("{{% for i in range({}) %}}{{{{ i }}}},{{% endfor %}}", args));
    assert_eq!(each("0"), "");
    assert_eq!(each("3, 1"), "");
    assert_eq!(each("2, 5"), "2,3,4,");
    assert_eq!(each("5, 0, -2"), "5,3,1,");
    assert_eq!(each("0, 1, 0.25"), "0,0.25,0.5,0.75,");
}

#[test]
fn test_range_rejects_bad_arguments() {
    let env = plain();
    for source in [
        "{{ range(1, 2, 0) }}",
        "{{ range(100001) }}",
        "{{ range(99999999999999999999) }}",
        "{{ range(0, 99999999999999999999, 1) }}",
    ] {
        let template = env.from_string(source).unwrap();
        let err = template.render().unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Runtime, "{}", source);
        assert!(err.message().starts_with("range()"), "{}", source);
    }
}

#[test]
fn test_string_repeat() {
    let env = plain();
    assert_eq!(render(&env, "[{{ 'ab' * 3 }}][{{ 2 * 'x' }}]"), "[ababab][xx]");
    assert_eq!(render(&env, "[{{ 'ab' * 0 }}][{{ 'ab' * -2 }}]"), "[][]");
}

#[test]
fn test_string_repeat_overflow_is_runtime_error() {
    let env = plain();
    for source in ["{{ 'ab' * 99999999999999999999 }}", "{{ 'x' * 10000001 }}"] {
        let template = env.from_string(source).unwrap();
        let err = template.render().unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Runtime);
        assert!(err.message().contains("string repetition exceeds the limit"));
        assert_eq!(err.line(), Some(1));
    }
}

#[test]
fn test_blocks_render_in_place() {
    let env = plain();
    assert_eq!(
        render(&env, "<{% block a %}A{% block b %}B{% endblock %}{% endblock %}>"),
        "<AB>"
    );
}

#[test]
fn test_runtime_error_has_line_and_name() {
    let env = plain();
    let template = env.from_source("ok\n{{ value() }}", "call.html").unwrap();
    let err = template.render_with([("value", 1)]).unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Runtime);
    assert_eq!(err.line(), Some(2));
    assert_eq!(err.template_name(), Some("call.html"));
    assert!(err.message().contains("'number' object is not callable"));
}

// ---
// Lexer options
// ---

#[test]
fn test_trim_blocks() {
    let source = "{% if true %}\nyes\n{% endif %}\n";
    assert_eq!(render(&plain(), source), "\nyes\n");
    let env = Environment::builder().trim_blocks(true).build().unwrap();
    assert_eq!(render(&env, source), "yes\n");
}

#[test]
fn test_keep_trailing_newline() {
    assert_eq!(render(&plain(), "x\n"), "x");
    let env = Environment::builder()
        .keep_trailing_newline(true)
        .build()
        .unwrap();
    assert_eq!(render(&env, "x\n"), "x\n");
}

#[test]
fn test_lexer_options_follow_attributes() {
    let env = plain();
    env.set_attribute("keep_trailing_newline", true);
    assert_eq!(render(&env, "x\n"), "x\n");
}
