use std::time::Duration;

use snapask_core::{ArtifactInfo, CommandKind, ResultMessage};
use snapask_overlay::{
    hotkeys::HotkeyAction,
    view_state::{OverlayEvent, OverlayState, OverlayViewState, SCROLL_STEP_PX, STATUS_CONNECTED},
};

fn artifact() -> ArtifactInfo {
    ArtifactInfo {
        captured_at_unix_ms: 1_700_000_000_000,
        device_id: "primary-display".to_owned(),
        byte_len: 2048,
        image_png_base64: None,
    }
}

fn connected_with_artifact() -> OverlayViewState {
    let mut view = OverlayViewState::new();
    view.apply(OverlayEvent::Connected {
        latest_artifact: Some(artifact()),
    });
    view
}

fn query(question: &str) -> OverlayEvent {
    OverlayEvent::SendQuery {
        question: question.to_owned(),
    }
}

#[test]
fn result_while_hidden_updates_silently_and_show_reveals_it() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Hide);
    assert_eq!(view.state(), OverlayState::Hidden);

    view.apply(OverlayEvent::Result(ResultMessage::answered(
        1,
        "use a hash map",
        None,
    )));
    assert_eq!(view.state(), OverlayState::Hidden);

    view.apply(OverlayEvent::Show);
    assert_eq!(view.state(), OverlayState::VisibleAnswered);
    assert_eq!(view.display_text(), "use a hash map");
}

#[test]
fn hide_and_show_preserve_loading() {
    let mut view = connected_with_artifact();
    assert!(view.apply(query("two sum")).is_some());
    view.apply(OverlayEvent::Hide);
    view.apply(OverlayEvent::Show);
    assert_eq!(view.state(), OverlayState::VisibleLoading);
}

#[test]
fn stale_result_is_ignored() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Result(ResultMessage::answered(5, "fifth", None)));
    view.apply(OverlayEvent::Result(ResultMessage::answered(3, "third", None)));
    assert_eq!(view.display_text(), "fifth");

    view.apply(OverlayEvent::Result(ResultMessage::answered(5, "fifth again", None)));
    assert_eq!(view.display_text(), "fifth again");
}

#[test]
fn send_query_emits_query_command_and_enters_loading() {
    let mut view = connected_with_artifact();
    assert_eq!(view.status(), STATUS_CONNECTED);

    let command = view
        .apply(query("use code to solve: reverse a list"))
        .expect("query command");
    assert_eq!(command.kind, CommandKind::Query);
    assert_eq!(
        command.question.as_deref(),
        Some("use code to solve: reverse a list")
    );
    assert_eq!(view.state(), OverlayState::VisibleLoading);

    // Not valid again until the answer arrives.
    assert!(view.apply(query("again")).is_none());

    view.apply(OverlayEvent::Result(ResultMessage::answered(1, "done", None)));
    assert_eq!(view.state(), OverlayState::VisibleAnswered);
    assert!(view.apply(query("follow-up")).is_some());
}

#[test]
fn send_query_is_ignored_when_hidden_or_without_artifact() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Hide);
    assert!(view.apply(query("hidden")).is_none());
    assert_eq!(view.state(), OverlayState::Hidden);

    let mut fresh = OverlayViewState::new();
    fresh.apply(OverlayEvent::Connected {
        latest_artifact: None,
    });
    assert!(fresh.apply(query("nothing captured")).is_none());
    assert_eq!(fresh.status(), "No screenshot captured yet");
    assert_eq!(fresh.state(), OverlayState::VisibleIdle);

    fresh.apply(OverlayEvent::Result(ResultMessage::captured(1, artifact())));
    assert_eq!(fresh.last_artifact(), Some(&artifact()));
    assert!(fresh.apply(query("now it works")).is_some());
}

#[test]
fn scroll_only_moves_when_answered_and_stays_in_bounds() {
    let mut view = connected_with_artifact();
    view.set_content_extent(1000.0, 400.0);
    view.apply(OverlayEvent::ScrollDown);
    assert_eq!(view.scroll_offset(), 0.0);

    view.apply(OverlayEvent::Result(ResultMessage::answered(1, "long answer", None)));
    view.set_content_extent(450.0, 400.0);
    view.apply(OverlayEvent::ScrollDown);
    assert_eq!(view.scroll_offset(), SCROLL_STEP_PX);
    view.apply(OverlayEvent::ScrollDown);
    assert_eq!(view.scroll_offset(), 50.0);

    view.apply(OverlayEvent::ScrollUp);
    view.apply(OverlayEvent::ScrollUp);
    assert_eq!(view.scroll_offset(), 0.0);
}

#[test]
fn new_result_resets_scroll_to_top() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Result(ResultMessage::answered(1, "first", None)));
    view.set_content_extent(2000.0, 400.0);
    view.apply(OverlayEvent::ScrollDown);
    assert!(view.scroll_offset() > 0.0);

    view.apply(OverlayEvent::Result(ResultMessage::answered(2, "second", None)));
    assert_eq!(view.scroll_offset(), 0.0);
}

#[test]
fn failed_result_is_shown_as_error() {
    let mut view = connected_with_artifact();
    view.apply(query("q"));
    view.apply(OverlayEvent::Result(ResultMessage::failed(1, "timeout")));
    assert_eq!(view.state(), OverlayState::VisibleAnswered);
    assert_eq!(view.display_text(), "Error: timeout");
}

#[test]
fn rejection_answers_pending_query_without_moving_the_watermark() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Result(ResultMessage::answered(4, "fourth", None)));
    view.apply(query("q"));
    view.apply(OverlayEvent::Result(ResultMessage::rejected(
        "rate limit exceeded",
    )));
    assert_eq!(view.display_text(), "Error: rate limit exceeded");

    view.apply(OverlayEvent::Result(ResultMessage::answered(4, "fourth again", None)));
    assert_eq!(view.display_text(), "fourth again");
}

#[test]
fn hotkey_actions_map_to_events() {
    assert_eq!(
        OverlayEvent::from_hotkey(HotkeyAction::Hide, || unreachable!()),
        OverlayEvent::Hide
    );
    assert_eq!(
        OverlayEvent::from_hotkey(HotkeyAction::SendQuery, || "q".to_owned()),
        query("q")
    );
}

#[test]
fn reconnect_restores_connected_status() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Disconnected {
        retry_in: Duration::from_secs(1),
    });
    assert!(view.apply(query("offline")).is_none());

    view.apply(OverlayEvent::Connected {
        latest_artifact: Some(artifact()),
    });
    assert_eq!(view.status(), STATUS_CONNECTED);
    assert_eq!(view.last_artifact(), Some(&artifact()));
}

#[test]
fn reconnect_to_restarted_relay_accepts_its_sequence_numbers() {
    let mut view = connected_with_artifact();
    view.apply(OverlayEvent::Result(ResultMessage::answered(7, "old relay", None)));

    view.apply(OverlayEvent::Disconnected {
        retry_in: Duration::from_secs(1),
    });
    view.apply(OverlayEvent::Connected {
        latest_artifact: None,
    });
    assert_eq!(view.last_artifact(), None);
    assert!(view.apply(query("before any capture")).is_none());
    assert_eq!(view.state(), OverlayState::VisibleAnswered);

    view.apply(OverlayEvent::Result(ResultMessage::captured(1, artifact())));
    assert_eq!(view.display_text(), "Screenshot captured");

    assert!(view.apply(query("fresh question")).is_some());
    view.apply(OverlayEvent::Result(ResultMessage::answered(
        2,
        "fresh answer from new relay",
        None,
    )));
    assert_eq!(view.state(), OverlayState::VisibleAnswered);
    assert_eq!(view.display_text(), "fresh answer from new relay");
}
