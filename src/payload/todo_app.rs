//! Functional checks for the `todo-app` exercise type.
//!
//! The repository is served on a loopback port and its entry page is driven
//! in headless Chrome. A task is typed in, completed and deleted, and every
//! step has to show up as a change in the DOM.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use crate::grading::result::RawResultFile;
use crate::submission::TestDetail;

use super::browser::{Control, ControlKind, Session};
use super::equal_share_score;
use super::static_server::StaticServer;

pub const CHECK_INITIAL_RENDER: &str = "初期表示";
pub const CHECK_ADD: &str = "タスク追加機能";
pub const CHECK_TOGGLE: &str = "タスク完了切り替え機能";
pub const CHECK_DELETE: &str = "タスク削除機能";

/// Every check, in the order it runs
pub const CHECKS: [&str; 4] = [CHECK_INITIAL_RENDER, CHECK_ADD, CHECK_TOGGLE, CHECK_DELETE];

const ENTRY_PAGES: [&str; 4] = ["index.html", "public/index.html", "dist/index.html", "src/index.html"];

/// Words that name a control. ASCII words compare as whole tokens, Japanese
/// phrases as substrings and symbols against the whole label.
struct Words {
    tokens: &'static [&'static str],
    phrases: &'static [&'static str],
    symbols: &'static [&'static str],
}

const ADD: Words = Words {
    tokens: &["add", "create", "new", "submit"],
    phrases: &["追加", "登録", "作成"],
    symbols: &["+", "＋"],
};

const TOGGLE: Words = Words {
    tokens: &["toggle", "complete", "completed", "done", "finish", "check"],
    phrases: &["完了", "済"],
    symbols: &["✓", "✔", "☐", "☑"],
};

const DELETE: Words = Words {
    tokens: &["delete", "remove", "trash", "del"],
    phrases: &["削除", "消去", "消す"],
    symbols: &["x", "×", "✕", "✖", "🗑", "🗑️"],
};

impl Words {
    fn matches_label(&self, label: &str) -> bool {
        let label = label.trim();
        if label.is_empty() {
            return false;
        }
        let lowered = label.to_lowercase();
        self.symbols.contains(&lowered.as_str())
            || self.phrases.iter().any(|p| label.contains(p))
            || tokens(label).iter().any(|t| self.tokens.contains(&t.as_str()))
    }

    fn matches(&self, control: &Control) -> bool {
        control.labels().iter().any(|label| self.matches_label(label))
    }
}

/// Splits a label into lowercase words on punctuation, spaces and camelCase
/// boundaries: `addTodo` and `add-button` both yield `add`.
fn tokens(label: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut after_lower = false;

    for c in label.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            after_lower = false;
            continue;
        }
        if c.is_uppercase() && after_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        after_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Serves the repository, opens its entry page and runs every check.
///
/// A page that never finishes loading is returned as
/// [`PageUnresponsive`](super::browser::PageUnresponsive) instead of a result.
pub fn grade(repo_dir: &Path) -> anyhow::Result<RawResultFile> {
    let repo_dir = repo_dir
        .canonicalize()
        .with_context(|| format!("repository directory {} is missing", repo_dir.display()))?;
    let entry = entry_page(&repo_dir)?;

    let server = StaticServer::start(&repo_dir)?;
    let session = Session::launch()?;
    let url = server.url(&entry);
    log::info!("Opening {url}");
    session.open(&url)?;

    let task = format!("grader task {}", std::process::id());
    let details = run_checks(&session, &task);

    Ok(RawResultFile {
        passed: details.iter().all(|d| d.passed),
        score: equal_share_score(&details),
        details,
        schema_version: None,
    })
}

/// The first known entry page, relative to the repository root.
fn entry_page(repo_dir: &Path) -> anyhow::Result<PathBuf> {
    match ENTRY_PAGES.iter().find(|p| repo_dir.join(p).is_file()) {
        Some(page) => Ok(PathBuf::from(page)),
        None => bail!("index.html not found in the repository"),
    }
}

fn run_checks(session: &Session, task: &str) -> Vec<TestDetail> {
    let initial = outcome(CHECK_INITIAL_RENDER, check_initial_render(session));
    let added = outcome(CHECK_ADD, check_add(session, task));

    // Toggling and deleting need the task the add check created
    let (toggled, deleted) = if added.passed {
        (
            outcome(CHECK_TOGGLE, check_toggle(session, task)),
            outcome(CHECK_DELETE, check_delete(session, task)),
        )
    } else {
        let skipped = "skipped because no task could be added";
        (
            TestDetail::new(CHECK_TOGGLE, false, skipped),
            TestDetail::new(CHECK_DELETE, false, skipped),
        )
    };

    vec![initial, added, toggled, deleted]
}

fn outcome(name: &str, result: anyhow::Result<TestDetail>) -> TestDetail {
    result.unwrap_or_else(|e| {
        log::warn!("{name} aborted: {e:#}");
        TestDetail::new(name, false, format!("{e:#}"))
    })
}

fn failed(name: &str, message: &str, expected: &str, actual: &str) -> TestDetail {
    let mut detail = TestDetail::new(name, false, message);
    detail.expected = Some(expected.to_string());
    detail.actual = Some(actual.to_string());
    detail
}

fn check_initial_render(session: &Session) -> anyhow::Result<TestDetail> {
    let rendered = session.wait_until(|s| {
        let layout = s.layout()?;
        Ok(layout.input && layout.list)
    })?;
    if rendered {
        return Ok(TestDetail::new(CHECK_INITIAL_RENDER, true, "task input and list are rendered"));
    }

    let layout = session.layout()?;
    Ok(failed(
        CHECK_INITIAL_RENDER,
        "the page does not render the task input and list",
        "text input: true, list: true",
        &format!("text input: {}, list: {}", layout.input, layout.list),
    ))
}

fn check_add(session: &Session, task: &str) -> anyhow::Result<TestDetail> {
    if !session.mark_entry()? {
        return Ok(TestDetail::new(CHECK_ADD, false, "no visible text input to type a task into"));
    }
    session.type_into_marked(task)?;

    let controls = session.controls(None)?;
    let used = match controls.iter().find(|c| c.kind == ControlKind::Button && ADD.matches(c)) {
        Some(control) if session.mark_control(control)? => {
            session.click_marked()?;
            "the add button"
        }
        _ => {
            session.press_enter()?;
            "Enter"
        }
    };

    if session.wait_until(|s| s.contains(task))? {
        Ok(TestDetail::new(CHECK_ADD, true, format!("a typed task is listed after pressing {used}")))
    } else {
        Ok(failed(
            CHECK_ADD,
            &format!("the typed task did not appear after pressing {used}"),
            &format!("\"{task}\" on the page"),
            "not found",
        ))
    }
}

fn check_toggle(session: &Session, task: &str) -> anyhow::Result<TestDetail> {
    let before = session
        .item_state(task)?
        .context("the added task is no longer on the page")?;

    let controls = session.controls(Some(task))?;
    let control = controls
        .iter()
        .find(|c| c.kind == ControlKind::Checkbox)
        .or_else(|| controls.iter().find(|c| TOGGLE.matches(c)));
    let marked = match control {
        Some(control) => session.mark_control(control)?,
        // Many apps toggle by clicking the task text itself
        None => session.mark_text(task)?,
    };
    if !marked {
        bail!("the added task is no longer on the page");
    }
    session.click_marked()?;

    let changed = session.wait_until(|s| {
        Ok(matches!(s.item_state(task)?, Some(after) if after != before))
    })?;
    if changed {
        Ok(TestDetail::new(CHECK_TOGGLE, true, "the task changes when it is marked as completed"))
    } else {
        Ok(failed(
            CHECK_TOGGLE,
            "marking the task as completed did not change it",
            "a checked box, class or style change on the task",
            "no change",
        ))
    }
}

fn check_delete(session: &Session, task: &str) -> anyhow::Result<TestDetail> {
    let controls = session.controls(Some(task))?;
    let Some(control) = controls
        .iter()
        .find(|c| c.kind == ControlKind::Button && DELETE.matches(c))
    else {
        return Ok(failed(
            CHECK_DELETE,
            "no delete button was found next to the task",
            "a button labelled delete or 削除",
            &format!("{} other controls", controls.len()),
        ));
    };
    if !session.mark_control(control)? {
        bail!("the delete button disappeared before it was clicked");
    }
    session.click_marked()?;

    if session.wait_until(|s| Ok(!s.contains(task)?))? {
        Ok(TestDetail::new(CHECK_DELETE, true, "the task is removed from the page"))
    } else {
        Ok(failed(
            CHECK_DELETE,
            "the task is still shown after clicking delete",
            "task removed",
            "task still listed",
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn button(text: &str) -> Control {
        Control {
            index: 0,
            kind: ControlKind::Button,
            text: text.to_string(),
            aria_label: String::new(),
            value: String::new(),
            test_id: String::new(),
        }
    }

    #[test]
    fn test_tokens_split_on_case_and_punctuation() {
        assert_eq!(tokens("addTodo"), vec!["add", "todo"]);
        assert_eq!(tokens("add-button"), vec!["add", "button"]);
        assert_eq!(tokens("  Delete Task "), vec!["delete", "task"]);
        assert_eq!(tokens("padding-lg"), vec!["padding", "lg"]);
        assert_eq!(tokens("ADD"), vec!["add"]);
    }

    #[test]
    fn test_words_inside_other_words_do_not_match() {
        assert!(!ADD.matches_label("padding-lg"));
        assert!(!ADD.matches_label("Address"));
        assert!(!ADD.matches_label("Home"));
        assert!(!DELETE.matches_label("undelete nothing"));
        assert!(!DELETE.matches_label("Extra"));
        assert!(!TOGGLE.matches_label("classList.toggled"));
        assert!(!TOGGLE.matches_label("undone"));
    }

    #[test]
    fn test_labels_that_name_the_action_match() {
        assert!(ADD.matches_label("Add"));
        assert!(ADD.matches_label("addTodo"));
        assert!(ADD.matches_label("+"));
        assert!(ADD.matches_label("タスクを追加"));
        assert!(TOGGLE.matches_label("Mark as done"));
        assert!(TOGGLE.matches_label("完了"));
        assert!(DELETE.matches_label("削除する"));
        assert!(DELETE.matches_label("×"));
        assert!(DELETE.matches_label(" X "));
        assert!(DELETE.matches_label("remove-item"));
    }

    #[test]
    fn test_every_visible_name_of_a_control_counts() {
        let mut control = button("🙂");
        assert!(!DELETE.matches(&control));

        control.aria_label = "Delete task".to_string();
        assert!(DELETE.matches(&control));

        let mut control = button("");
        control.test_id = "add-todo".to_string();
        assert!(ADD.matches(&control));

        let mut control = button("");
        control.value = "追加".to_string();
        assert!(ADD.matches(&control));
    }

    #[test]
    fn test_entry_page_is_found_in_known_places() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("public")).unwrap();
        fs::write(dir.path().join("public/index.html"), "<ul></ul>").unwrap();
        assert_eq!(entry_page(dir.path()).unwrap(), PathBuf::from("public/index.html"));

        fs::write(dir.path().join("index.html"), "<ul></ul>").unwrap();
        assert_eq!(entry_page(dir.path()).unwrap(), PathBuf::from("index.html"));
    }

    #[test]
    fn test_missing_entry_page_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = grade(dir.path()).unwrap_err();
        assert!(err.to_string().contains("index.html not found"));
    }
}
