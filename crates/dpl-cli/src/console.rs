use chrono::{DateTime, Local};
use dpl_core::Notification;
use dpl_sync::{NotificationSink, ServiceRow};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Prints notifications to stdout as they are emitted.
#[derive(Default)]
pub struct ConsoleSink {
    printed: AtomicUsize,
}

impl ConsoleSink {
    pub fn printed(&self) -> usize {
        self.printed.load(Ordering::SeqCst)
    }
}

impl NotificationSink for ConsoleSink {
    fn notify(&self, notification: &Notification) {
        let line = format_notification(notification, Local::now());
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        self.printed.fetch_add(1, Ordering::SeqCst);
    }
}

fn format_notification(notification: &Notification, at: DateTime<Local>) -> String {
    format!(
        "{} [{}] {}",
        at.format("%H:%M:%S"),
        notification.kind,
        notification.message
    )
}

pub fn render_rows(rows: &[ServiceRow]) -> String {
    let id_width = column_width(rows.iter().map(|row| row.service_id.as_str()), "ID");
    let name_width = column_width(rows.iter().map(|row| row.name.as_str()), "SERVICE");
    let mut out = format!(
        "{:<id_width$}  {:<name_width$}  {:<8}  STATUS\n",
        "ID", "SERVICE", "CLASS"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<id_width$}  {:<name_width$}  {:<8}  {}\n",
            row.service_id,
            row.name,
            row.class.as_str(),
            row.status.as_deref().unwrap_or("-"),
        ));
    }
    out
}

fn column_width<'a>(values: impl Iterator<Item = &'a str>, header: &str) -> usize {
    values
        .map(|value| value.chars().count())
        .max()
        .unwrap_or(0)
        .max(header.len())
}
