use lib_psych::core::{Dispatcher, FieldValue, ItemUpdate, PsychFrame};
use std::sync::Arc;
use tokio::sync::broadcast;

const CLIENT_ID: &str = "monitor";

/// Logs every frame the provider publishes until shutdown.
pub async fn run(dispatcher: Arc<Dispatcher>, mut shutdown: broadcast::Receiver<()>) {
    let mut frames = dispatcher.add_client(CLIENT_ID);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            frame = frames.recv() => match frame {
                Some(frame) => log_frame(&frame),
                None => break,
            },
        }
    }

    dispatcher.remove_client(CLIENT_ID);
    log::info!("Monitor stopped.");
}

fn log_frame(frame: &PsychFrame) {
    match frame {
        PsychFrame::Refresh(update) => log::debug!("{}", describe(update)),
        PsychFrame::Withdraw { stream } => log::info!("WITHDRAW {}", stream),
    }
}

pub fn describe(update: &ItemUpdate) -> String {
    let header = update
        .header
        .fields()
        .into_iter()
        .map(|(fid, value)| format!("{}={}", fid, value));
    let values = update.fields.iter().map(|f| match f.value {
        FieldValue::Real(_) => format!("{}={}", f.field_id, f.value.as_f64().unwrap_or_default()),
        FieldValue::Blank => format!("{}=", f.field_id),
    });
    let lock = update
        .lock
        .as_ref()
        .map(|l| format!(" lock={}:{:?}", l.service_id(), l.codes()))
        .unwrap_or_default();
    format!(
        "REFRESH {}{} {}",
        update.stream,
        lock,
        header.chain(values).collect::<Vec<_>>().join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_psych::core::{EntitlementLock, FieldEntry, StreamHandle, UpdateHeader};

    #[test]
    fn test_describe() {
        let update = ItemUpdate {
            stream: StreamHandle::new(7, "EURUSD"),
            lock: EntitlementLock::for_code(1234, 6205),
            header: UpdateHeader {
                display_name: "EURUSD".to_string(),
                topic: "FX".to_string(),
                source: "News".to_string(),
                engine_version: None,
                timestamp: None,
            },
            fields: vec![
                FieldEntry { field_id: 22, value: FieldValue::Real(1_100_000) },
                FieldEntry { field_id: 25, value: FieldValue::Blank },
            ],
        };
        assert_eq!(
            describe(&update),
            "REFRESH EURUSD#7 lock=1234:[6205] 1026=EURUSD 1686=News 22=1.1 25="
        );
    }
}
