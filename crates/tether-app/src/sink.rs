//! Forwards manager events to stdout as `event` lines.

use std::sync::Arc;

use tether_pty::{ExitReason, FailureKind, ProcessState, TerminalEventListener};

use crate::ipc::{EventMessage, Outbox, Outgoing, TerminalEvent};

pub struct EventSink {
    outbox: Arc<Outbox>,
}

impl EventSink {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }

    fn send(&self, instance_id: &str, event: TerminalEvent) {
        self.outbox.send(&Outgoing::Event(EventMessage {
            instance_id: instance_id.to_string(),
            event,
        }));
    }
}

impl TerminalEventListener for EventSink {
    fn on_terminal_output(&self, instance_id: &str, text: &str) {
        self.send(
            instance_id,
            TerminalEvent::Output {
                text: text.to_string(),
            },
        );
    }

    fn on_terminal_state_changed(&self, instance_id: &str, old: ProcessState, new: ProcessState) {
        log::debug!("Terminal {instance_id}: {old} -> {new}");
        self.send(instance_id, TerminalEvent::StateChanged { old, new });
    }

    fn on_terminal_process_exited(
        &self,
        instance_id: &str,
        exit_code: Option<i32>,
        reason: ExitReason,
    ) {
        self.send(instance_id, TerminalEvent::ProcessExited { exit_code, reason });
    }

    fn on_terminal_error(
        &self,
        instance_id: &str,
        kind: FailureKind,
        message: &str,
        operation: Option<&str>,
    ) {
        self.send(
            instance_id,
            TerminalEvent::Error {
                kind,
                message: message.to_string(),
                operation: operation.map(str::to_string),
            },
        );
    }

    fn on_terminal_size_changed(&self, instance_id: &str, rows: u16, cols: u16) {
        self.send(instance_id, TerminalEvent::SizeChanged { rows, cols });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::tests::Capture;

    #[test]
    fn test_each_callback_becomes_one_line() {
        let capture = Capture::default();
        let sink = EventSink::new(Arc::new(Outbox::new(Box::new(capture.clone()))));

        sink.on_terminal_output("a", "hi");
        sink.on_terminal_state_changed("a", ProcessState::Stopped, ProcessState::Starting);
        sink.on_terminal_process_exited("a", Some(0), ExitReason::NaturalExit);
        sink.on_terminal_error("a", FailureKind::Write, "broken pipe", Some("write"));
        sink.on_terminal_size_changed("a", 40, 120);

        let lines = capture.lines();
        let events: Vec<&str> = lines
            .iter()
            .map(|l| l["event"].as_str().unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                "output",
                "state_changed",
                "process_exited",
                "error",
                "size_changed"
            ]
        );
        assert!(lines.iter().all(|l| l["type"] == "event" && l["instance_id"] == "a"));
        assert_eq!(lines[2]["exit_code"], 0);
        assert_eq!(lines[3]["kind"], "write");
        assert_eq!(lines[3]["operation"], "write");
        assert_eq!(lines[4]["rows"], 40);
    }
}
