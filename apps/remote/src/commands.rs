use anyhow::{anyhow, bail, Context, Result};
use preamp_core::parse_active_flag;
use preamp_sync::{Control, EngineView, TubeDraft, UserIntent};

/// One line typed at the prompt
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Intent(UserIntent),
    LoadTube(u32),
    DeleteTube(u32),
    SaveTube(TubeDraft),
    AddTube(TubeDraft),
    View,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  vol <n> | bal <n> | bri <n>      set a control
  input <n>                        select input slot
  mute | standby                   toggle mute / standby
  refresh                          full resync
  tubes                            refresh the tube list
  tube select|load|del <n>         edit, reload or delete a tube
  tube save|add <n> <Y|N> <h> <m>  write a tube record
  hide | show | suspend | resume   app lifecycle
  view | help | quit";

/// Parse a prompt line. Blank lines yield `None`.
pub fn parse_action(line: &str) -> Result<Option<Action>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let action = match (verb.to_ascii_lowercase().as_str(), args) {
        ("vol", [value]) => set_control(Control::Volume, value)?,
        ("bal", [value]) => set_control(Control::Balance, value)?,
        ("bri", [value]) => set_control(Control::Brightness, value)?,
        ("input", [slot]) => Action::Intent(UserIntent::SelectInput(number(slot)?)),
        ("mute", []) => Action::Intent(UserIntent::ToggleMute),
        ("standby", []) => Action::Intent(UserIntent::ToggleStandby),
        ("refresh", []) => Action::Intent(UserIntent::RefreshAll),
        ("tubes", []) => Action::Intent(UserIntent::RefreshTubes),
        ("tube", [sub, rest @ ..]) => parse_tube(sub, rest)?,
        ("hide", []) => Action::Intent(UserIntent::SetVisible(false)),
        ("show", []) => Action::Intent(UserIntent::SetVisible(true)),
        ("suspend", []) => Action::Intent(UserIntent::Suspend),
        ("resume", []) => Action::Intent(UserIntent::Resume),
        ("view", []) => Action::View,
        ("help", []) => Action::Help,
        ("quit" | "exit", []) => Action::Quit,
        _ => bail!("unknown command: {}", line.trim()),
    };
    Ok(Some(action))
}

fn parse_tube(sub: &str, args: &[&str]) -> Result<Action> {
    let action = match (sub.to_ascii_lowercase().as_str(), args) {
        ("select", [num]) => Action::Intent(UserIntent::SelectTube(number(num)?)),
        ("load", [num]) => Action::LoadTube(number(num)?),
        ("del" | "delete", [num]) => Action::DeleteTube(number(num)?),
        ("save", [num, active, hours, minutes]) => {
            Action::SaveTube(draft(num, active, hours, minutes)?)
        }
        ("add", [num, active, hours, minutes]) => {
            Action::AddTube(draft(num, active, hours, minutes)?)
        }
        _ => bail!("usage: tube select|load|del <n> or tube save|add <n> <Y|N> <h> <m>"),
    };
    Ok(action)
}

fn set_control(control: Control, value: &str) -> Result<Action> {
    Ok(Action::Intent(UserIntent::SetControl(control, number(value)?)))
}

fn number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("not a number: {}", value))
}

fn draft(num: &str, active: &str, hours: &str, minutes: &str) -> Result<TubeDraft> {
    Ok(TubeDraft {
        num: number(num).context("tube number")?,
        active: parse_active_flag(active),
        hours: number(hours).context("hours")?,
        minutes: number(minutes).context("minutes")?,
    })
}

/// Intents that carry out a tube action, given what the editor currently holds
pub fn intents_for(action: Action, view: &EngineView) -> Vec<UserIntent> {
    match action {
        Action::Intent(intent) => vec![intent],
        Action::LoadTube(num) => vec![
            UserIntent::EditTube(TubeDraft {
                num: i64::from(num),
                ..view.tube_draft
            }),
            UserIntent::LoadTube,
        ],
        // re-selecting would disarm a pending confirmation
        Action::DeleteTube(num) if view.tube_draft.num == i64::from(num) => {
            vec![UserIntent::DeleteTube]
        }
        // a number missing from the list still has to reach the editor, or the
        // delete would act on whatever tube the draft holds
        Action::DeleteTube(num) if view.tubes.iter().any(|tube| tube.num == num) => {
            vec![UserIntent::SelectTube(num), UserIntent::DeleteTube]
        }
        Action::DeleteTube(num) => vec![
            UserIntent::EditTube(TubeDraft {
                num: i64::from(num),
                ..view.tube_draft
            }),
            UserIntent::DeleteTube,
        ],
        Action::SaveTube(draft) => vec![UserIntent::EditTube(draft), UserIntent::SaveTube],
        Action::AddTube(draft) => vec![UserIntent::EditTube(draft), UserIntent::AddTube],
        Action::View | Action::Help | Action::Quit => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preamp_core::TubeRecord;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(
            parse_action("vol 30").unwrap(),
            Some(Action::Intent(UserIntent::SetControl(Control::Volume, 30)))
        );
        assert_eq!(
            parse_action("  BAL -3 ").unwrap(),
            Some(Action::Intent(UserIntent::SetControl(Control::Balance, -3)))
        );
        assert_eq!(
            parse_action("input 2").unwrap(),
            Some(Action::Intent(UserIntent::SelectInput(2)))
        );
        assert_eq!(parse_action("quit").unwrap(), Some(Action::Quit));
        assert_eq!(parse_action("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_action("vol loud").is_err());
        assert!(parse_action("mute now").is_err());
        assert!(parse_action("tube save 1 Y").is_err());
        assert!(parse_action("dance").is_err());
    }

    #[test]
    fn test_parse_tube_save() {
        assert_eq!(
            parse_action("tube save 3 yes 120 15").unwrap(),
            Some(Action::SaveTube(TubeDraft {
                num: 3,
                active: true,
                hours: 120,
                minutes: 15
            }))
        );
    }

    fn tube(num: u32) -> TubeRecord {
        TubeRecord {
            num,
            active: true,
            age_hours: 0,
            age_minutes: 0,
        }
    }

    #[test]
    fn test_delete_keeps_confirmation_for_same_tube() {
        let mut view = EngineView::default();
        view.tubes = vec![tube(2), tube(4)];
        view.tube_draft.num = 4;

        assert_eq!(
            intents_for(Action::DeleteTube(4), &view),
            vec![UserIntent::DeleteTube]
        );
        assert_eq!(
            intents_for(Action::DeleteTube(2), &view),
            vec![UserIntent::SelectTube(2), UserIntent::DeleteTube]
        );
    }

    #[test]
    fn test_delete_unknown_tube_targets_requested_number() {
        let mut view = EngineView::default();
        view.tubes = vec![tube(4)];
        view.tube_draft.num = 4;
        view.tube_draft.hours = 12;

        let first = intents_for(Action::DeleteTube(9), &view);
        assert_eq!(
            first,
            vec![
                UserIntent::EditTube(TubeDraft {
                    num: 9,
                    active: true,
                    hours: 12,
                    minutes: 0
                }),
                UserIntent::DeleteTube
            ]
        );

        // the engine now holds 9 in the draft; the second press only confirms
        view.tube_draft.num = 9;
        assert_eq!(
            intents_for(Action::DeleteTube(9), &view),
            vec![UserIntent::DeleteTube]
        );
    }

    #[test]
    fn test_load_keeps_other_draft_fields() {
        let mut view = EngineView::default();
        view.tube_draft.hours = 50;

        let intents = intents_for(Action::LoadTube(6), &view);
        match &intents[0] {
            UserIntent::EditTube(draft) => {
                assert_eq!(draft.num, 6);
                assert_eq!(draft.hours, 50);
            }
            other => panic!("unexpected intent: {:?}", other),
        }
        assert_eq!(intents[1], UserIntent::LoadTube);
    }
}
