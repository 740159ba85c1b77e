use preamp_sync::EngineView;
use std::fmt::Write;

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Multi-line human-readable rendering of the engine view
pub fn render_view(view: &EngineView) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "connection: {:?} ({})", view.connection, view.status);
    let _ = writeln!(
        out,
        "volume: {}  balance: {}  brightness: {}",
        or_dash(view.volume),
        or_dash(view.balance),
        or_dash(view.brightness)
    );

    let inputs: Vec<String> = view
        .input_options
        .iter()
        .map(|option| {
            let marker = if view.active_input.as_deref() == Some(option.slot.to_string().as_str()) {
                "*"
            } else {
                ""
            };
            format!("{}{}={}", marker, option.slot, option.label)
        })
        .collect();
    let _ = writeln!(out, "inputs: {}", inputs.join("  "));

    let mute = match (view.muted, view.mute_pending) {
        (Some(muted), true) => format!("{} (pending)", muted),
        (muted, _) => or_dash(muted),
    };
    let amp = if view.standby_in_flight {
        format!("{} (changing)", view.amp_state_label)
    } else {
        view.amp_state_label.clone()
    };
    let temperature = view
        .temperature_celsius
        .map_or_else(|| "NA".to_string(), |t| format!("{:.1}C", t));
    let _ = writeln!(out, "mute: {}  amp: {}  temp: {}", mute, amp, temperature);

    if view.tubes.is_empty() {
        let _ = writeln!(out, "tubes: none");
    } else {
        let _ = writeln!(out, "tubes:");
        for tube in &view.tubes {
            let marker = if view.selected_tube == Some(tube.num) { ">" } else { " " };
            let _ = writeln!(out, " {} {}", marker, tube);
        }
    }

    let draft = &view.tube_draft;
    let _ = write!(
        out,
        "editor: #{} {} {}h {}m",
        draft.num,
        if draft.active { 'Y' } else { 'N' },
        draft.hours,
        draft.minutes
    );
    if view.editor_dirty {
        out.push_str(" (edited)");
    }
    if let Some(num) = view.delete_armed {
        let _ = write!(out, " [delete {} armed]", num);
    }
    out.push('\n');

    if view.queued_commands > 0 {
        let _ = writeln!(out, "queued: {}", view.queued_commands);
    }
    if let Some(notice) = &view.notice {
        let _ = writeln!(out, "notice: {}", notice);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use preamp_core::TubeRecord;

    #[test]
    fn test_render_view() {
        let mut view = EngineView {
            volume: Some(30),
            active_input: Some("2".to_string()),
            amp_state_label: "Operate".to_string(),
            notice: Some("Tube list refreshed.".to_string()),
            selected_tube: Some(1),
            ..Default::default()
        };
        view.tubes.push(TubeRecord {
            num: 1,
            active: true,
            age_hours: 10,
            age_minutes: 5,
        });

        let text = render_view(&view);
        assert!(text.contains("volume: 30  balance: -"));
        assert!(text.contains("amp: Operate  temp: NA"));
        assert!(text.contains(" > #1 Y 10h 5m"));
        assert!(text.contains("notice: Tube list refreshed."));
    }
}
