use std::sync::{Arc, Mutex, mpsc};

use clap::Parser;
use eframe::egui::{self, Color32, RichText, Sense, ViewportCommand};
use global_hotkey::{GlobalHotKeyEvent, HotKeyState};
use snapask_core::CommandRequest;
use snapask_overlay::{
    config::OverlayConfig,
    hotkeys::{self, DEFAULT_BINDINGS},
    session::{SessionConfig, compose_question, run_session},
    view_state::{OverlayEvent, OverlayViewState},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

const WINDOW_SIZE: [f32; 2] = [651.0, 413.0];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = OverlayConfig::parse();
    let server_url = match config.validate() {
        Ok(url) => url,
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    let (event_tx, event_rx) = mpsc::channel::<OverlayEvent>();
    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel::<CommandRequest>();

    runtime.spawn(run_session(
        SessionConfig {
            server_url: server_url.to_string(),
            name: config.name.clone(),
        },
        event_tx.clone(),
        command_rx,
    ));

    // Hotkeys only fire while the manager lives.
    let _hotkey_manager = match hotkeys::register(&DEFAULT_BINDINGS) {
        Ok((manager, map)) => {
            let prefix = config.prompt_prefix.clone();
            let hotkey_tx = event_tx.clone();
            GlobalHotKeyEvent::set_event_handler(Some(move |event: GlobalHotKeyEvent| {
                if event.state != HotKeyState::Pressed {
                    return;
                }
                let Some(action) = map.action_for(event.id) else {
                    return;
                };
                let event = OverlayEvent::from_hotkey(action, || {
                    compose_question(&prefix, read_clipboard_text().as_deref())
                });
                let _ = hotkey_tx.send(event);
            }));
            Some(manager)
        }
        Err(err) => {
            warn!("global hotkeys unavailable: {err}");
            None
        }
    };
    drop(event_tx);

    info!(server_url = %server_url, "overlay starting");

    let view = Arc::new(Mutex::new(OverlayViewState::new()));
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("SnapAsk")
            .with_inner_size(WINDOW_SIZE)
            .with_resizable(false)
            .with_decorations(false)
            .with_transparent(true)
            .with_always_on_top()
            .with_taskbar(false),
        ..Default::default()
    };

    let app_view = view.clone();
    let result = eframe::run_native(
        "SnapAsk",
        options,
        Box::new(move |cc| {
            let ctx = cc.egui_ctx.clone();
            std::thread::spawn(move || drive_events(event_rx, view, command_tx, ctx));
            Ok(Box::new(OverlayApp { view: app_view }))
        }),
    );

    if let Err(err) = result {
        error!("overlay window failed: {err}");
        std::process::exit(1);
    }
    runtime.shutdown_background();
}

fn read_clipboard_text() -> Option<String> {
    match arboard::Clipboard::new().and_then(|mut clipboard| clipboard.get_text()) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!("clipboard read failed: {err}");
            None
        }
    }
}

/// Feeds queued events through the state machine, off the UI thread so a hidden window still
/// reacts to hotkeys.
fn drive_events(
    events: mpsc::Receiver<OverlayEvent>,
    view: Arc<Mutex<OverlayViewState>>,
    commands: UnboundedSender<CommandRequest>,
    ctx: egui::Context,
) {
    while let Ok(event) = events.recv() {
        let (command, visibility_change) = {
            let Ok(mut view) = view.lock() else {
                error!("overlay state lock poisoned");
                return;
            };
            let was_visible = view.is_visible();
            let command = view.apply(event);
            let now_visible = view.is_visible();
            (command, (now_visible != was_visible).then_some(now_visible))
        };

        if let Some(command) = command
            && commands.send(command).is_err()
        {
            warn!("session stopped; query dropped");
        }
        if let Some(visible) = visibility_change {
            ctx.send_viewport_cmd(ViewportCommand::Visible(visible));
        }
        ctx.request_repaint();
    }
}

struct OverlayApp {
    view: Arc<Mutex<OverlayViewState>>,
}

impl eframe::App for OverlayApp {
    fn clear_color(&self, _visuals: &egui::Visuals) -> [f32; 4] {
        [0.0, 0.0, 0.0, 0.0]
    }

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let Ok(mut view) = self.view.lock() else {
            return;
        };

        egui::CentralPanel::default()
            .frame(
                egui::Frame::none()
                    .fill(Color32::from_rgba_unmultiplied(0, 0, 0, 180))
                    .rounding(10.0)
                    .inner_margin(egui::Margin::same(10.0)),
            )
            .show(ctx, |ui| {
                let background =
                    ui.interact(ui.max_rect(), egui::Id::new("overlay_drag"), Sense::drag());
                if background.drag_started() {
                    ctx.send_viewport_cmd(ViewportCommand::StartDrag);
                }

                let showing_status = view.display_text() == view.status();
                let output = egui::ScrollArea::vertical()
                    .auto_shrink([false, false])
                    .enable_scrolling(false)
                    .max_height(if showing_status {
                        f32::INFINITY
                    } else {
                        ui.available_height() - 24.0
                    })
                    .vertical_scroll_offset(view.scroll_offset())
                    .show(ui, |ui| {
                        ui.label(
                            RichText::new(view.display_text())
                                .size(16.0)
                                .color(Color32::WHITE),
                        );
                    });
                view.set_content_extent(output.content_size.y, output.inner_rect.height());

                if !showing_status {
                    ui.separator();
                    ui.label(
                        RichText::new(view.status())
                            .small()
                            .color(Color32::LIGHT_GRAY),
                    );
                }
            });
    }
}
