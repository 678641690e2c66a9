// tests/parser_tests.rs

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use common::*;
use stencil::ast::{AssignTarget, Expr, Stmt, StmtNode};
use stencil::{
    Environment, EnvironmentId, ErrorType, Extension, ExtensionSpec, LoopControlsExtension,
    Parser, TemplateError,
};

fn parse(env: &Environment, source: &str) -> Result<Vec<StmtNode>, TemplateError> {
    env.parse(source, Some("t.html"), None)
}

fn plain() -> Environment {
    Environment::builder().build().unwrap()
}

// ---
// Core statements
// ---

#[test]
fn test_parse_for_with_else() {
    let body = parse(&plain(), "{% for k, v in items %}{{ k }}{% else %}none{% endfor %}").unwrap();
    assert_eq!(body.len(), 1);
    match &body[0].value {
        Stmt::For {
            target,
            body,
            else_body,
            ..
        } => {
            assert!(matches!(target, AssignTarget::Tuple(names) if names.len() == 2));
            assert_eq!(body.len(), 1);
            assert_eq!(else_body.len(), 1);
        }
        other => panic!("expected a for loop, got {:?}", other),
    }
}

#[test]
fn test_parse_if_elif_else_chain() {
    let body = parse(&plain(), "{% if a %}1{% elif b %}2{% else %}3{% endif %}").unwrap();
    let Stmt::If { else_body, .. } = &body[0].value else {
        panic!("expected an if statement");
    };
    assert!(matches!(&else_body[0].value, Stmt::If { .. }));
}

#[test]
fn test_output_nodes_keep_lines() {
    let body = parse(&plain(), "a\n{{ b }}\n{% set c = 1 %}").unwrap();
    let Stmt::Output(children) = &body[0].value else {
        panic!("expected output");
    };
    assert!(matches!(&children[1].value, Expr::Name(name) if name == "b"));
    assert_eq!(children[1].line, 2);
    assert_eq!(body[1].line, 3);
}

// ---
// Unknown tags and nesting
// ---

#[test]
fn test_unknown_tag_message() {
    let err = parse(&plain(), "{% for x in y %}\n{% foo %}{% endfor %}").unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Syntax);
    assert_eq!(err.line(), Some(2));
    assert_eq!(err.template_name(), Some("t.html"));
    assert_eq!(
        err.message(),
        "Encountered unknown tag 'foo'. Stencil was looking for the following tags: \
         'endfor' or 'else'. The innermost block that needs to be closed is 'for'."
    );
}

#[test]
fn test_unknown_tag_at_top_level() {
    let err = parse(&plain(), "{% foo %}").unwrap_err();
    assert_eq!(err.message(), "Encountered unknown tag 'foo'.");
}

#[test]
fn test_nesting_mistake_message() {
    let err = parse(&plain(), "{% if x %}{% for y in z %}{% endif %}{% endfor %}").unwrap_err();
    assert!(err.message().starts_with(
        "Encountered unknown tag 'endif'. You probably made a nesting mistake."
    ));
    assert!(err
        .message()
        .ends_with("The innermost block that needs to be closed is 'for'."));
}

#[test]
fn test_unexpected_end_of_template() {
    let err = parse(&plain(), "{% for x in y %}\n\n{{ body }}").unwrap_err();
    assert!(err.message().starts_with("Unexpected end of template."));
    assert!(err.message().contains("'endfor' or 'else'"));
    assert_eq!(err.line(), Some(3));
}

#[test]
fn test_extension_tag_unknown_without_extension() {
    let err = parse(&plain(), "{% for x in y %}{% break %}{% endfor %}").unwrap_err();
    assert!(err.message().contains("Encountered unknown tag 'break'."));

    let env = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    assert!(parse(&env, "{% for x in y %}{% break %}{% endfor %}").is_ok());
}

#[test]
fn test_break_outside_loop_is_rejected() {
    let env = env_with(vec![ExtensionSpec::of::<LoopControlsExtension>()]);
    let err = env.compile("\n{% break %}", None, None).unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Syntax);
    assert!(err.message().contains("'break' outside of a loop"));
    assert_eq!(err.line(), Some(2));
}

#[test]
fn test_block_defined_twice() {
    let err = parse(&plain(), "{% block a %}{% endblock %}{% block a %}{% endblock %}").unwrap_err();
    assert!(err.message().contains("block 'a' defined twice"));
}

#[test]
fn test_reserved_keyword_cannot_be_claimed() {
    #[derive(Debug)]
    struct Greedy(EnvironmentId);
    impl Extension for Greedy {
        fn new(environment: EnvironmentId) -> Self {
            Greedy(environment)
        }
        fn environment(&self) -> EnvironmentId {
            self.0
        }
        fn tags(&self) -> &[&'static str] {
            &["for"]
        }
    }

    let err = Environment::builder().extension::<Greedy>().build().unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Configuration);
    assert!(err.message().contains("reserved"));
}

// ---
// Extension parse hooks
// ---

static SEEN_LINE: AtomicU32 = AtomicU32::new(0);

#[derive(Debug)]
struct LineProbe(EnvironmentId);

impl Extension for LineProbe {
    fn new(environment: EnvironmentId) -> Self {
        LineProbe(environment)
    }

    fn environment(&self) -> EnvironmentId {
        self.0
    }

    fn tags(&self) -> &[&'static str] {
        &["probe"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let keyword = parser.stream().next_token()?;
        assert!(keyword.is_name("probe"));
        SEEN_LINE.store(keyword.line, Ordering::SeqCst);
        let value = parser.parse_expression()?;
        Ok(vec![StmtNode::new(Stmt::Output(vec![value]), keyword.line)])
    }
}

#[test]
fn test_parse_hook_starts_on_keyword() {
    let env = Environment::builder().extension::<LineProbe>().build().unwrap();
    let body = parse(&env, "\n\n{% probe 1 + 2 %}").unwrap();
    assert_eq!(SEEN_LINE.load(Ordering::SeqCst), 3);
    assert_eq!(body.last().unwrap().line, 3);
    assert_eq!(render(&env, "{% probe 1 + 2 %}"), "3");
}

#[test]
fn test_parse_hook_without_parser_reports_tag() {
    let env = env_with(vec![ExtensionSpec::of::<ShadowWithExtension>()]);
    let err = parse(&env, "{% with %}").unwrap_err();
    assert!(err.message().contains("does not implement a parser for tag 'with'"));
}
