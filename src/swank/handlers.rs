//! SWANK operations served by the bridge.
//!
//! Operations the evaluator has no counterpart for reply `nil` so the editor
//! keeps working; evaluation and introspection go through the evaluator link.

use log::debug;

use super::dispatch::{BoxFuture, HandlerResult, HandlerTable, Outbox};
use super::protocol::{self, SwankResponse};
use super::session::Session;
use crate::error::{BridgeError, BridgeResult};
use crate::evaluator::{EvalItem, RecoveryAction};
use crate::sexp::{self, Value};

/// Protocol version reported in `connection-info`.
pub const SWANK_VERSION: &str = "2.20";

/// Fuzzy completion only starts from this many characters.
const FUZZY_MIN_PREFIX: usize = 2;

/// Operations acknowledged with `nil`.
const NO_OP_OPERATIONS: &[&str] = &[
    "swank:buffer-first-change",
    "swank:swank-require",
    "swank:init-presentations",
    "swank:inspect-current-condition",
    "swank:find-definitions-for-emacs",
    "swank:complete-form",
    "swank:backtrace",
];

const INTERACTIVE_EVAL_OPERATIONS: &[&str] = &[
    "swank:eval",
    "swank:interactive-eval",
    "swank:interactive-eval-region",
    "swank:pprint-eval",
];

pub fn default_handlers() -> HandlerTable {
    let mut table = HandlerTable::new();
    table.register("swank:connection-info", connection_info);
    table.register("swank:create-repl", create_repl);
    table.register("swank-repl:create-repl", create_repl);
    for operation in NO_OP_OPERATIONS {
        table.register(operation, no_op);
    }
    for operation in INTERACTIVE_EVAL_OPERATIONS {
        table.register(operation, interactive_eval);
    }
    table.register("swank-repl:listener-eval", listener_eval);
    table.register("swank:compile-string-for-emacs", compile_string);
    table.register("swank:compile-notes-for-emacs", compile_string);
    table.register("swank:compile-file-for-emacs", compile_file);
    table.register("swank:describe-symbol", describe_symbol);
    table.register("swank:describe-definition-for-emacs", describe_symbol);
    table.register("swank:describe-function", describe_function);
    table.register("swank:swank-expand-1", expand_1);
    table.register("swank:simple-completions", simple_completions);
    table.register("swank:fuzzy-completions", fuzzy_completions);
    table.register("swank:autodoc", autodoc);
    table.register("swank:operator-arglist", operator_arglist);
    table.register("swank:invoke-nth-restart-for-emacs", invoke_nth_restart);
    table.register("swank:sldb-abort", sldb_abort);
    table.register("swank:throw-to-toplevel", sldb_abort);
    table.register("swank:sldb-continue", sldb_continue);
    table.register("swank:quit-lisp", quit_lisp);
    table
}

fn missing_or_mistyped(operation: &str, index: usize, expected: &str, got: Option<&Value>) -> BridgeError {
    match got {
        Some(value) => BridgeError::invalid_arguments(
            operation,
            format!("argument {} must be {}, got {}", index, expected, value),
        ),
        None => BridgeError::invalid_arguments(operation, format!("missing argument {}", index)),
    }
}

/// String or symbol argument, with one level of quoting removed.
fn string_arg(args: &[Value], index: usize, operation: &str) -> BridgeResult<String> {
    match args.get(index).map(Value::unquote) {
        Some(Value::String(text)) | Some(Value::Symbol(text)) => Ok(text.clone()),
        other => Err(missing_or_mistyped(operation, index, "a string", other)),
    }
}

fn integer_arg(args: &[Value], index: usize, operation: &str) -> BridgeResult<i64> {
    let value = args.get(index);
    value
        .and_then(Value::as_integer)
        .ok_or_else(|| missing_or_mistyped(operation, index, "an integer", value))
}

fn level_arg(args: &[Value], index: usize, operation: &str) -> BridgeResult<usize> {
    let level = integer_arg(args, index, operation)?;
    usize::try_from(level)
        .ok()
        .filter(|level| *level > 0)
        .ok_or_else(|| {
            BridgeError::invalid_arguments(operation, format!("invalid debugger level {}", level))
        })
}

/// Run `form` as a user evaluation, forwarding printed output to the editor.
///
/// Returns the result as the evaluator printed it.
async fn evaluate(
    session: &mut Session,
    form: &str,
    outbox: &Outbox,
) -> BridgeResult<Option<String>> {
    let mut stream = session.link()?.eval(form).await?;
    let mut result = None;
    while let Some(item) = stream.next().await {
        match item? {
            EvalItem::Text(text) => outbox.send(protocol::write_string(text)),
            EvalItem::Result { printed, .. } => result = Some(printed),
            EvalItem::Complete => break,
        }
    }
    Ok(result)
}

/// Run an introspection form; evaluator errors become an abort reply.
async fn introspect(session: &mut Session, form: String) -> HandlerResult {
    let link = session.link()?;
    match link.exec_once(&form).await {
        Ok(value) => Ok(SwankResponse::ok(value.display_text().trim().to_string())),
        Err(report) if !report.fatal => {
            debug!(
                target: "swankbridge::swank",
                "Introspection failed: {}",
                report.message
            );
            link.acknowledge_recovery();
            Ok(SwankResponse::abort(report.message))
        }
        Err(report) => Err(report.into()),
    }
}

/// Close debugger `level` with `action` and answer the request that opened it.
async fn recover(
    session: &mut Session,
    level: usize,
    action: RecoveryAction,
    outbox: &Outbox,
) -> HandlerResult {
    let (closed, outcome) = session.apply_recovery(level, action).await?;
    outbox.send(protocol::debug_return(closed.level));
    outbox.send(SwankResponse::abort(closed.message).into_message(closed.call_id));
    // A failed action is reported in the acknowledgment; the next request
    // needing the evaluator opens a debugger for it.
    match outcome {
        Ok(()) => Ok(SwankResponse::abort("NIL")),
        Err(report) => Ok(SwankResponse::abort(report.message)),
    }
}

fn connection_info<'a>(
    session: &'a mut Session,
    _args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let version = session
            .link()?
            .exec_once("(lisp-implementation-version)")
            .await?;
        let name = session.settings().implementation.clone();
        let machine = std::env::consts::ARCH.to_uppercase();

        Ok(SwankResponse::ok(Value::plist([
            ("pid", Value::Integer(i64::from(std::process::id()))),
            ("style", Value::Nil),
            (
                "encoding",
                Value::plist([(
                    "coding-systems",
                    Value::list([
                        Value::string("utf-8-unix"),
                        Value::string("iso-latin-1-unix"),
                    ]),
                )]),
            ),
            (
                "lisp-implementation",
                Value::plist([
                    ("type", Value::string(name.clone())),
                    ("name", Value::string(name.clone())),
                    ("version", version),
                    ("program", Value::Nil),
                ]),
            ),
            (
                "machine",
                Value::plist([
                    ("type", Value::string(machine.clone())),
                    ("version", Value::string(machine)),
                ]),
            ),
            (
                "package",
                Value::plist([
                    ("name", Value::string(name.clone())),
                    ("prompt", Value::string(name)),
                ]),
            ),
            ("version", Value::string(SWANK_VERSION)),
        ])))
    })
}

fn create_repl<'a>(
    session: &'a mut Session,
    _args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let name = session.settings().implementation.clone();
        Ok(SwankResponse::ok(Value::list([
            Value::string(name.clone()),
            Value::string(name),
        ])))
    })
}

fn no_op<'a>(
    _session: &'a mut Session,
    _args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async { Ok(SwankResponse::ok(Value::Nil)) })
}

fn interactive_eval<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let form = string_arg(&args, 0, "swank:interactive-eval")?;
        let printed = evaluate(session, &form, outbox).await?;
        Ok(SwankResponse::ok(
            printed.unwrap_or_else(|| "; No value".to_string()),
        ))
    })
}

fn listener_eval<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let form = string_arg(&args, 0, "swank-repl:listener-eval")?;
        if let Some(printed) = evaluate(session, &form, outbox).await? {
            outbox.send(protocol::repl_result(printed));
            outbox.send(protocol::repl_result("\n"));
        }
        Ok(SwankResponse::ok(Value::Nil))
    })
}

fn compilation_result() -> Value {
    Value::list([
        Value::keyword("compilation-result"),
        Value::Nil,
        Value::T,
        Value::Float(0.01),
        Value::Nil,
        Value::Nil,
    ])
}

fn compile_string<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let form = string_arg(&args, 0, "swank:compile-string-for-emacs")?;
        evaluate(session, &form, outbox).await?;
        Ok(SwankResponse::ok(compilation_result()))
    })
}

fn compile_file<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let path = string_arg(&args, 0, "swank:compile-file-for-emacs")?;
        let form = format!("(load {})", sexp::encode(&Value::string(path)));
        evaluate(session, &form, outbox).await?;
        Ok(SwankResponse::ok(compilation_result()))
    })
}

fn describe_symbol<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let symbol = string_arg(&args, 0, "swank:describe-symbol")?;
        introspect(
            session,
            format!("(with-output-to-string (s) (describe '{} s))", symbol),
        )
        .await
    })
}

fn describe_function<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let function = string_arg(&args, 0, "swank:describe-function")?;
        introspect(session, format!("(documentation '{})", function)).await
    })
}

fn expand_1<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let form = string_arg(&args, 0, "swank:swank-expand-1")?;
        introspect(
            session,
            format!("(with-output-to-string (s) (pprint (macroexpand '{}) s))", form),
        )
        .await
    })
}

/// Symbol names in the evaluator starting with `prefix`, sorted.
///
/// An evaluator error while searching yields no candidates.
async fn find_completions(session: &mut Session, prefix: &str) -> BridgeResult<Vec<String>> {
    let form = format!(
        "(mapcar #'string (apropos-list {}))",
        sexp::encode(&Value::string(prefix))
    );
    let link = session.link()?;
    let found = match link.exec_once(&form).await {
        Ok(value) => value,
        Err(report) if !report.fatal => {
            debug!(
                target: "swankbridge::swank",
                "Completion lookup failed: {}",
                report.message
            );
            link.acknowledge_recovery();
            return Ok(Vec::new());
        }
        Err(report) => return Err(report.into()),
    };

    let prefix = prefix.to_lowercase();
    let mut names: Vec<String> = found
        .as_list()
        .unwrap_or_default()
        .iter()
        .filter_map(|item| item.as_str().or_else(|| item.as_symbol()))
        .map(str::to_lowercase)
        .filter(|name| name.starts_with(&prefix))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

fn completion_reply(names: Vec<String>, common: String) -> SwankResponse {
    SwankResponse::ok(Value::list([
        Value::list(names.into_iter().map(Value::string)),
        Value::string(common),
    ]))
}

/// `(simple-completions prefix package)` answers `((name...) longest-common)`.
fn simple_completions<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let prefix = string_arg(&args, 0, "swank:simple-completions")?;
        let names = find_completions(session, &prefix).await?;
        let common = match names.as_slice() {
            [only] => only.clone(),
            _ => prefix,
        };
        Ok(completion_reply(names, common))
    })
}

/// `(fuzzy-completions prefix package :limit n ...)`
fn fuzzy_completions<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let prefix = string_arg(&args, 0, "swank:fuzzy-completions")?;
        if prefix.chars().count() < FUZZY_MIN_PREFIX {
            return Ok(SwankResponse::ok(Value::Nil));
        }
        let limit = args
            .get(3)
            .and_then(Value::as_integer)
            .and_then(|limit| usize::try_from(limit).ok());

        let mut names = find_completions(session, &prefix).await?;
        if let Some(limit) = limit {
            names.truncate(limit);
        }
        Ok(completion_reply(names, prefix))
    })
}

fn autodoc<'a>(
    _session: &'a mut Session,
    _args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async {
        Ok(SwankResponse::ok(Value::list([
            Value::keyword("not-available"),
            Value::T,
        ])))
    })
}

fn operator_arglist<'a>(
    _session: &'a mut Session,
    _args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async { Ok(SwankResponse::ok("")) })
}

fn invoke_nth_restart<'a>(
    session: &'a mut Session,
    args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        const OPERATION: &str = "swank:invoke-nth-restart-for-emacs";
        let level = level_arg(&args, 0, OPERATION)?;
        let index = integer_arg(&args, 1, OPERATION)?;
        let action = RecoveryAction::from_index(index).ok_or_else(|| {
            BridgeError::invalid_arguments(OPERATION, format!("no restart numbered {}", index))
        })?;
        recover(session, level, action, outbox).await
    })
}

fn sldb_abort<'a>(
    session: &'a mut Session,
    _args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        match session.debugger().innermost().map(|innermost| innermost.level) {
            Some(level) => recover(session, level, RecoveryAction::Quit, outbox).await,
            None => Ok(SwankResponse::abort("NIL")),
        }
    })
}

fn sldb_continue<'a>(
    session: &'a mut Session,
    _args: Vec<Value>,
    outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        match session.debugger().innermost().map(|innermost| innermost.level) {
            Some(level) => recover(session, level, RecoveryAction::Continue, outbox).await,
            None => Ok(SwankResponse::abort("NIL")),
        }
    })
}

fn quit_lisp<'a>(
    session: &'a mut Session,
    _args: Vec<Value>,
    _outbox: &'a Outbox,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        session.shutdown().await;
        session.request_shutdown();
        Ok(SwankResponse::ok(Value::Nil))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;
    use crate::error::ErrorReport;
    use tokio_util::sync::CancellationToken;

    fn detached() -> Session {
        Session::new(BridgeSettings::default(), CancellationToken::new())
    }

    async fn call(
        session: &mut Session,
        operation: &str,
        args: Vec<Value>,
    ) -> (HandlerResult, Vec<Value>) {
        let table = default_handlers();
        let handler = table.lookup(operation).expect("handler registered");
        let (outbox, mut receiver) = Outbox::channel();
        let result = handler(session, args, &outbox).await;
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        (result, messages)
    }

    #[test]
    fn every_listed_operation_is_registered() {
        let table = default_handlers();

        for operation in [
            "swank:connection-info",
            "swank-repl:create-repl",
            "swank:backtrace",
            "swank:pprint-eval",
            "swank-repl:listener-eval",
            "swank:compile-file-for-emacs",
            "swank:describe-definition-for-emacs",
            "swank:swank-expand-1",
            "swank:simple-completions",
            "swank:fuzzy-completions",
            "swank:throw-to-toplevel",
            "swank:quit-lisp",
        ] {
            assert!(table.lookup(operation).is_some(), "{} missing", operation);
        }
    }

    #[tokio::test]
    async fn create_repl_reports_package_and_prompt() {
        let mut session = detached();

        let (result, messages) = call(&mut session, "swank-repl:create-repl", vec![Value::Nil]).await;

        assert_eq!(
            result.unwrap(),
            SwankResponse::ok(Value::list([
                Value::string("irteusgl"),
                Value::string("irteusgl")
            ]))
        );
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn no_op_operations_reply_nil() {
        let mut session = detached();

        let (result, _) = call(&mut session, "swank:swank-require", vec![Value::Nil]).await;

        assert_eq!(result.unwrap(), SwankResponse::ok(Value::Nil));
    }

    #[tokio::test]
    async fn fuzzy_completion_needs_two_characters() {
        let mut session = detached();

        let (result, messages) = call(
            &mut session,
            "swank:fuzzy-completions",
            vec![
                Value::string("c"),
                Value::string("irteusgl"),
                Value::keyword("limit"),
                Value::Integer(300),
            ],
        )
        .await;

        assert_eq!(result.unwrap(), SwankResponse::ok(Value::Nil));
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn simple_completion_without_evaluator_is_fatal_report() {
        let mut session = detached();

        let (result, _) = call(
            &mut session,
            "swank:simple-completions",
            vec![Value::string("car"), Value::string("irteusgl")],
        )
        .await;

        match result {
            Err(BridgeError::Report(report)) => assert!(report.fatal),
            other => panic!("expected fatal report, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn autodoc_is_not_available() {
        let mut session = detached();

        let (result, _) = call(&mut session, "swank:autodoc", Vec::new()).await;

        assert_eq!(
            sexp::encode(&result.unwrap().into_message(1)),
            "(:return (:ok (:not-available t)) 1)"
        );
    }

    #[tokio::test]
    async fn evaluation_without_evaluator_is_fatal_report() {
        let mut session = detached();

        let (result, _) = call(
            &mut session,
            "swank:interactive-eval",
            vec![Value::string("(+ 1 2)")],
        )
        .await;

        match result {
            Err(BridgeError::Report(report)) => assert!(report.fatal),
            other => panic!("expected fatal report, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn evaluation_requires_form_argument() {
        let mut session = detached();

        let (result, _) = call(&mut session, "swank:interactive-eval", Vec::new()).await;

        assert!(matches!(result, Err(BridgeError::InvalidArguments { .. })));
    }

    #[tokio::test]
    async fn invoke_restart_sends_return_messages_in_order() {
        let mut session = detached();
        session
            .debugger_mut()
            .open(5, ErrorReport::evaluator("boom", Vec::new()));

        let (result, messages) = call(
            &mut session,
            "swank:invoke-nth-restart-for-emacs",
            vec![Value::Integer(1), Value::Integer(1)],
        )
        .await;

        assert_eq!(result.unwrap(), SwankResponse::abort("NIL"));
        let rendered: Vec<String> = messages.iter().map(sexp::encode).collect();
        assert_eq!(
            rendered,
            vec![
                "(:debug-return 0 1 nil)".to_string(),
                "(:return (:abort \"boom\") 5)".to_string(),
            ]
        );
        assert!(session.debugger().is_empty());
    }

    #[tokio::test]
    async fn failed_restart_still_answers_with_acknowledgment() {
        let settings = BridgeSettings::from(crate::config::BridgeConfig {
            program: Some("nonexistent-evaluator-xyz123".to_string()),
            ..Default::default()
        });
        let mut session = Session::new(settings, CancellationToken::new());
        session
            .debugger_mut()
            .open(5, ErrorReport::evaluator("boom", Vec::new()));

        let (result, messages) = call(
            &mut session,
            "swank:invoke-nth-restart-for-emacs",
            vec![Value::Integer(1), Value::Integer(2)],
        )
        .await;

        let rendered: Vec<String> = messages.iter().map(sexp::encode).collect();
        assert_eq!(
            rendered,
            vec![
                "(:debug-return 0 1 nil)".to_string(),
                "(:return (:abort \"boom\") 5)".to_string(),
            ]
        );
        match result.unwrap() {
            SwankResponse::Abort(message) => {
                assert!(message.contains("Failed to spawn"), "{}", message)
            }
            other => panic!("expected abort acknowledgment, got {:?}", other),
        }
        assert!(session.debugger().is_empty());
        assert!(!session.has_link());
    }

    #[tokio::test]
    async fn invoke_restart_rejects_unknown_restart() {
        let mut session = detached();
        session
            .debugger_mut()
            .open(5, ErrorReport::evaluator("boom", Vec::new()));

        let (result, messages) = call(
            &mut session,
            "swank:invoke-nth-restart-for-emacs",
            vec![Value::Integer(1), Value::Integer(7)],
        )
        .await;

        assert!(matches!(result, Err(BridgeError::InvalidArguments { .. })));
        assert!(messages.is_empty());
        assert_eq!(session.debugger().depth(), 1);
    }

    #[tokio::test]
    async fn sldb_abort_quits_innermost_level() {
        let mut session = detached();
        session
            .debugger_mut()
            .open(1, ErrorReport::evaluator("outer", Vec::new()));
        session
            .debugger_mut()
            .open(2, ErrorReport::evaluator("inner", Vec::new()));

        let (result, messages) = call(&mut session, "swank:sldb-abort", Vec::new()).await;

        assert_eq!(result.unwrap(), SwankResponse::abort("NIL"));
        assert_eq!(sexp::encode(&messages[0]), "(:debug-return 0 2 nil)");
        assert!(session.debugger().is_empty());
    }

    #[tokio::test]
    async fn sldb_abort_without_debugger_is_harmless() {
        let mut session = detached();

        let (result, messages) = call(&mut session, "swank:throw-to-toplevel", Vec::new()).await;

        assert_eq!(result.unwrap(), SwankResponse::abort("NIL"));
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn quit_lisp_requests_shutdown() {
        let mut session = detached();
        let token = session.shutdown_token();

        let (result, _) = call(&mut session, "swank:quit-lisp", Vec::new()).await;

        assert_eq!(result.unwrap(), SwankResponse::ok(Value::Nil));
        assert!(token.is_cancelled());
    }

    #[test]
    fn string_arg_unquotes_and_accepts_symbols() {
        let args = vec![
            sexp::decode("'\"irteusgl\"").unwrap(),
            Value::symbol("car"),
            sexp::decode("'(\"irteusgl\")").unwrap(),
        ];

        assert_eq!(string_arg(&args, 0, "op").unwrap(), "irteusgl");
        assert_eq!(string_arg(&args, 1, "op").unwrap(), "car");
        assert!(string_arg(&args, 2, "op").is_err());
        assert!(string_arg(&args, 3, "op").is_err());
    }

    #[test]
    fn level_arg_rejects_zero() {
        let err = level_arg(&[Value::Integer(0)], 0, "op").unwrap_err();

        assert!(err.to_string().contains("invalid debugger level 0"));
    }
}
