//! Call-stack frames and nested debugger sessions.

use log::debug;

use crate::error::ErrorReport;
use crate::sexp::Value;

/// Leading lines of a call-stack dump that describe the introspection
/// command itself rather than the failed evaluation.
pub const CALL_STACK_PADDING: usize = 4;

/// One frame of an evaluator call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub index: usize,
    pub description: String,
    pub restartable: bool,
}

impl StackFrame {
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            restartable: false,
        }
    }

    /// `(index "description" (:restartable nil))`
    pub fn to_value(&self) -> Value {
        Value::list([
            Value::Integer(self.index as i64),
            Value::string(self.description.clone()),
            Value::plist([("restartable", Value::bool(self.restartable))]),
        ])
    }
}

/// Parse the evaluator's call-stack dump.
///
/// The first [`CALL_STACK_PADDING`] lines are skipped. Each following line
/// must look like `<n>: at <description>`; parsing stops at the first line
/// that does not. Frames are numbered by position.
pub fn parse_call_stack(text: &str) -> Vec<StackFrame> {
    text.lines()
        .map(str::trim)
        .skip(CALL_STACK_PADDING)
        .map_while(|line| {
            let (number, description) = line.split_once(": at ")?;
            number.trim().parse::<usize>().ok()?;
            Some(description.to_string())
        })
        .enumerate()
        .map(|(index, description)| StackFrame::new(index, description))
        .collect()
}

/// Fixed restarts offered in every debugger session, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Quit,
    Continue,
    Restart,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 3] = [
        RecoveryAction::Quit,
        RecoveryAction::Continue,
        RecoveryAction::Restart,
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            RecoveryAction::Quit => "QUIT",
            RecoveryAction::Continue => "CONTINUE",
            RecoveryAction::Restart => "RESTART",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            RecoveryAction::Quit => "Quit to the SLIME top level",
            RecoveryAction::Continue => "Ignore the error and continue in the same stack level",
            RecoveryAction::Restart => "Restart the evaluator process",
        }
    }

    /// `(("QUIT" "...") ("CONTINUE" "...") ("RESTART" "..."))`
    pub fn restarts_value() -> Value {
        Value::list(Self::ALL.iter().map(|action| {
            Value::list([
                Value::string(action.name()),
                Value::string(action.description()),
            ])
        }))
    }
}

/// An open debugger session, created when an operation fails.
#[derive(Debug, Clone, PartialEq)]
pub struct DebuggerSession {
    /// 1-based nesting depth
    pub level: usize,
    /// Request id of the operation that failed
    pub call_id: i64,
    pub message: String,
    pub frames: Vec<StackFrame>,
    /// The evaluator link is unusable until restarted
    pub fatal: bool,
}

/// Nested debugger sessions, innermost last.
#[derive(Debug, Default)]
pub struct DebuggerStack {
    sessions: Vec<DebuggerSession>,
}

impl DebuggerStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session one level deeper than the current innermost.
    pub fn open(&mut self, call_id: i64, report: ErrorReport) -> &DebuggerSession {
        let level = self.sessions.len() + 1;
        debug!(
            target: "swankbridge::debugger",
            "Entering debugger level {} for request {}: {}",
            level,
            call_id,
            report.message
        );
        self.sessions.push(DebuggerSession {
            level,
            call_id,
            message: report.message,
            frames: report.frames,
            fatal: report.fatal,
        });
        &self.sessions[level - 1]
    }

    /// Close the session at `level` together with any nested inside it.
    pub fn take(&mut self, level: usize) -> Option<DebuggerSession> {
        if level == 0 || level > self.sessions.len() {
            return None;
        }
        let mut closed = self.sessions.split_off(level - 1);
        if closed.len() > 1 {
            debug!(
                target: "swankbridge::debugger",
                "Closing {} nested debugger levels above {}",
                closed.len() - 1,
                level
            );
        }
        Some(closed.swap_remove(0))
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn depth(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn innermost(&self) -> Option<&DebuggerSession> {
        self.sessions.last()
    }

    pub fn get(&self, level: usize) -> Option<&DebuggerSession> {
        level.checked_sub(1).and_then(|i| self.sessions.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parse_skips_padding_and_numbers_frames_by_position() {
        let text = "h1\nh2\nh3\nh4\n0: at real-frame\n1: at other-frame\n";

        let frames = parse_call_stack(text);

        assert_eq!(
            frames,
            vec![
                StackFrame::new(0, "real-frame"),
                StackFrame::new(1, "other-frame")
            ]
        );
    }

    #[test]
    fn parse_stops_at_first_non_frame_line() {
        let text = "h1\nh2\nh3\nh4\n0: at (foo)\nprompt> \n1: at (bar)\n";

        let frames = parse_call_stack(text);

        assert_eq!(frames, vec![StackFrame::new(0, "(foo)")]);
    }

    #[test]
    fn parse_renumbers_frames_from_zero() {
        let text = "Call Stack (max depth: 14):\n0: at (print-callstack 14)\n1: at a\n2: at b\n3: at (error \"boom\")\n4: at (user-fn 1)\n";

        let frames = parse_call_stack(text);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], StackFrame::new(0, "(error \"boom\")"));
        assert_eq!(frames[1], StackFrame::new(1, "(user-fn 1)"));
    }

    #[test]
    fn parse_tolerates_surrounding_whitespace() {
        let text = "a\nb\nc\nd\n   0: at   spaced  \r\n";

        let frames = parse_call_stack(text);

        assert_eq!(frames, vec![StackFrame::new(0, "  spaced")]);
    }

    #[test]
    fn parse_short_output_yields_no_frames() {
        assert!(parse_call_stack("only\ntwo lines").is_empty());
        assert!(parse_call_stack("").is_empty());
    }

    #[test]
    fn frame_value_shape() {
        let frame = StackFrame::new(2, "(foo)");

        assert_eq!(frame.to_value().to_string(), "(2 \"(foo)\" (:restartable nil))");
    }

    #[rstest]
    #[case(0, Some(RecoveryAction::Quit))]
    #[case(1, Some(RecoveryAction::Continue))]
    #[case(2, Some(RecoveryAction::Restart))]
    #[case(3, None)]
    #[case(-1, None)]
    fn recovery_action_from_index(#[case] index: i64, #[case] expected: Option<RecoveryAction>) {
        assert_eq!(RecoveryAction::from_index(index), expected);
    }

    #[test]
    fn restarts_are_listed_in_index_order() {
        let restarts = RecoveryAction::restarts_value().to_string();

        let quit = restarts.find("\"QUIT\"").unwrap();
        let cont = restarts.find("\"CONTINUE\"").unwrap();
        let restart = restarts.find("\"RESTART\"").unwrap();
        assert!(quit < cont && cont < restart);
    }

    #[test]
    fn sessions_nest_with_increasing_levels() {
        let mut stack = DebuggerStack::new();

        assert_eq!(stack.open(7, ErrorReport::evaluator("first", Vec::new())).level, 1);
        assert_eq!(stack.open(8, ErrorReport::fatal("second")).level, 2);

        assert_eq!(stack.depth(), 2);
        let innermost = stack.innermost().unwrap();
        assert_eq!(innermost.call_id, 8);
        assert!(innermost.fatal);
    }

    #[test]
    fn take_closes_level_and_everything_nested() {
        let mut stack = DebuggerStack::new();
        stack.open(1, ErrorReport::evaluator("outer", Vec::new()));
        stack.open(2, ErrorReport::evaluator("inner", Vec::new()));

        let closed = stack.take(1).unwrap();

        assert_eq!(closed.message, "outer");
        assert!(stack.is_empty());
    }

    #[test]
    fn take_innermost_keeps_outer_levels() {
        let mut stack = DebuggerStack::new();
        stack.open(1, ErrorReport::evaluator("outer", Vec::new()));
        stack.open(2, ErrorReport::evaluator("inner", Vec::new()));

        let closed = stack.take(2).unwrap();

        assert_eq!(closed.call_id, 2);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.get(1).unwrap().message, "outer");
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    fn take_unknown_level_is_none(#[case] level: usize) {
        let mut stack = DebuggerStack::new();
        stack.open(1, ErrorReport::evaluator("only", Vec::new()));

        assert!(stack.take(level).is_none());
        assert_eq!(stack.depth(), 1);
    }
}
