//! `tray-icon` rendering of [`TrayMenu`].
//!
//! The icon lives on the platform event loop, which must own the main
//! thread (GTK on Linux, AppKit on macOS). [`run`] takes over the calling
//! thread and runs the rest of the app on a worker thread.

use std::sync::{Arc, Mutex};
use std::thread;

use tao::event::{Event, StartCause};
use tao::event_loop::{ControlFlow, EventLoopBuilder, EventLoopProxy};
use tokio::sync::mpsc;
use tray_icon::menu::{CheckMenuItem, IsMenuItem, Menu, MenuEvent, MenuItem, PredefinedMenuItem, Submenu};
use tray_icon::{TrayIcon, TrayIconBuilder};

use crate::tray::{MenuEntry, TrayMenu, TraySurface};

pub enum UserEvent {
    Menu(MenuEvent),
    Render(TrayMenu),
    Exit,
}

/// Forwards rebuilt menus to the event loop thread.
struct LoopSurface(Mutex<EventLoopProxy<UserEvent>>);

impl TraySurface for LoopSurface {
    fn apply(&self, menu: &TrayMenu) {
        if let Ok(proxy) = self.0.lock() {
            let _ = proxy.send_event(UserEvent::Render(menu.clone()));
        }
    }
}

enum Item {
    Plain(MenuItem),
    Check(CheckMenuItem),
    Sub(Submenu),
    Separator(PredefinedMenuItem),
}

impl Item {
    fn as_dyn(&self) -> &dyn IsMenuItem {
        match self {
            Item::Plain(i) => i,
            Item::Check(i) => i,
            Item::Sub(i) => i,
            Item::Separator(i) => i,
        }
    }
}

fn convert(entry: &MenuEntry) -> Result<Item, tray_icon::menu::Error> {
    Ok(match entry {
        MenuEntry::Action { id, label, .. } => {
            Item::Plain(MenuItem::with_id(id.as_str(), label, true, None))
        }
        MenuEntry::Check {
            id, label, checked, ..
        } => Item::Check(CheckMenuItem::with_id(id.as_str(), label, true, *checked, None)),
        MenuEntry::Submenu { label, entries } => {
            let children = entries.iter().map(convert).collect::<Result<Vec<_>, _>>()?;
            let refs: Vec<&dyn IsMenuItem> = children.iter().map(Item::as_dyn).collect();
            Item::Sub(Submenu::with_items(label, true, &refs)?)
        }
        MenuEntry::Separator => Item::Separator(PredefinedMenuItem::separator()),
    })
}

fn native_menu(menu: &TrayMenu) -> Result<Menu, tray_icon::menu::Error> {
    let native = Menu::new();
    for entry in &menu.entries {
        native.append(convert(entry)?.as_dyn())?;
    }
    Ok(native)
}

fn render(icon: &TrayIcon, menu: &TrayMenu) {
    match native_menu(menu) {
        Ok(native) => icon.set_menu(Some(Box::new(native))),
        Err(e) => log::warn!("[Tray] Failed to build native menu: {}", e),
    }
    if let Err(e) = icon.set_tooltip(Some(&menu.tooltip)) {
        log::warn!("[Tray] Failed to set tooltip: {}", e);
    }
}

/// Runs the platform event loop on this thread and `app` on a worker
/// thread. `app` gets the surface to publish menus on and the ids of
/// clicked items. The process exits when `app` returns.
pub fn run<F>(app: F) -> !
where
    F: FnOnce(Arc<dyn TraySurface>, mpsc::UnboundedReceiver<String>) -> anyhow::Result<()>
        + Send
        + 'static,
{
    let event_loop = EventLoopBuilder::<UserEvent>::with_user_event().build();

    MenuEvent::set_event_handler(Some({
        let proxy = Mutex::new(event_loop.create_proxy());
        move |event| {
            if let Ok(proxy) = proxy.lock() {
                let _ = proxy.send_event(UserEvent::Menu(event));
            }
        }
    }));

    let (clicks, clicked) = mpsc::unbounded_channel();
    let surface: Arc<dyn TraySurface> = Arc::new(LoopSurface(Mutex::new(event_loop.create_proxy())));
    let exit = event_loop.create_proxy();
    thread::spawn(move || {
        if let Err(e) = app(surface, clicked) {
            log::error!("[Tray] {:#}", e);
        }
        let _ = exit.send_event(UserEvent::Exit);
    });

    let mut icon: Option<TrayIcon> = None;
    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Wait;

        match event {
            Event::NewEvents(StartCause::Init) => {
                let first = TrayMenu::minimal();
                let built = native_menu(&first).map_err(anyhow::Error::from).and_then(|menu| {
                    TrayIconBuilder::new()
                        .with_menu(Box::new(menu))
                        .with_tooltip(&first.tooltip)
                        .build()
                        .map_err(anyhow::Error::from)
                });
                match built {
                    Ok(i) => {
                        log::info!("[Tray] Native tray icon created");
                        icon = Some(i);
                    }
                    Err(e) => log::error!("[Tray] Native tray unavailable: {}", e),
                }
            }
            Event::UserEvent(UserEvent::Menu(event)) => {
                let _ = clicks.send(event.id.0);
            }
            Event::UserEvent(UserEvent::Render(menu)) => {
                if let Some(icon) = &icon {
                    render(icon, &menu);
                }
            }
            Event::UserEvent(UserEvent::Exit) => {
                drop(icon.take());
                *control_flow = ControlFlow::Exit;
            }
            _ => {}
        }
    })
}
