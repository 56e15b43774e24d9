//! A headless Chrome tab with a small set of DOM helpers injected into the
//! page under test.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Upper bound for loading a page and for any single DevTools call
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a page gets to react to a click or key press
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(120);

const MARKED: &str = "[data-grader-target]";

// Installed once per document; every evaluation is prefixed with it so the
// helpers survive reloads triggered by the page itself.
const HELPERS: &str = r#"(() => {
  if (window.__grader) return;
  window.confirm = () => true;
  window.alert = () => {};
  window.prompt = () => null;

  const CONTROLS = 'button, input[type=submit], input[type=button], input[type=checkbox], a, [role=button], [role=checkbox]';
  const TEXT_INPUTS = 'input:not([type]), input[type=text], textarea';
  const visible = (el) => {
    const style = getComputedStyle(el);
    const rect = el.getBoundingClientRect();
    return style.visibility !== 'hidden' && style.display !== 'none' && rect.width > 0 && rect.height > 0;
  };
  const findText = (text) => {
    const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
    while (walker.nextNode()) {
      const parent = walker.currentNode.parentElement;
      if (parent && parent.tagName !== 'SCRIPT' && parent.tagName !== 'STYLE' && walker.currentNode.nodeValue.includes(text)) {
        return parent;
      }
    }
    return null;
  };
  const itemOf = (text) => {
    const el = findText(text);
    if (!el) return null;
    const item = el.closest('li, [role=listitem], tr');
    if (item) return item;
    let node = el;
    while (node.parentElement && node.parentElement !== document.body) {
      node = node.parentElement;
      if (node.querySelector(CONTROLS)) return node;
    }
    return el;
  };
  const mark = (el) => {
    document.querySelectorAll('[data-grader-target]').forEach((e) => e.removeAttribute('data-grader-target'));
    el.setAttribute('data-grader-target', '');
    return true;
  };

  window.__grader = {
    found: [],
    layout() {
      const input = Array.from(document.querySelectorAll(TEXT_INPUTS)).some(visible);
      const list = document.querySelector('ul, ol, table, [role=list]') !== null;
      return JSON.stringify({ input, list });
    },
    entry() {
      const el = Array.from(document.querySelectorAll(TEXT_INPUTS)).find(visible);
      return el ? mark(el) : false;
    },
    controls(text) {
      const scope = text === null ? document.body : itemOf(text);
      this.found = scope ? Array.from(scope.querySelectorAll(CONTROLS)).filter(visible) : [];
      return JSON.stringify(this.found.map((el, index) => {
        const checkbox = el.type === 'checkbox' || el.getAttribute('role') === 'checkbox';
        return {
          index,
          kind: checkbox ? 'checkbox' : 'button',
          text: (el.innerText || '').trim(),
          ariaLabel: el.getAttribute('aria-label') || '',
          value: el.tagName === 'INPUT' && !checkbox ? el.value || '' : '',
          testId: el.getAttribute('data-testid') || '',
        };
      }));
    },
    mark(index) {
      const el = this.found[index];
      return el && el.isConnected ? mark(el) : false;
    },
    markText(text) {
      const el = findText(text);
      return el ? mark(el) : false;
    },
    contains(text) {
      return findText(text) !== null;
    },
    state(text) {
      const item = itemOf(text);
      if (!item) return JSON.stringify(null);
      const parent = item.parentElement;
      const parts = [item, ...item.querySelectorAll('*')].map((el) => {
        const style = getComputedStyle(el);
        return [
          el.getAttribute('class') || '',
          el.getAttribute('aria-checked') || '',
          el.getAttribute('aria-pressed') || '',
          el.getAttribute('style') || '',
          el.checked === true,
          style.textDecorationLine,
          style.opacity,
        ].join('|');
      });
      parts.push(parent ? `${parent.id}|${parent.getAttribute('class') || ''}` : '');
      return JSON.stringify(parts);
    },
  };
})();
"#;

/// The page did not finish loading, usually because a script never yields.
#[derive(Debug, thiserror::Error)]
#[error("the page did not finish loading within {}s", .timeout.as_secs())]
pub struct PageUnresponsive {
    pub timeout: Duration,
}

/// Whether a Chrome executable can be found (`CHROME` or the usual paths).
pub fn is_available() -> bool {
    headless_chrome::browser::default_executable().is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Button,
    Checkbox,
}

/// A visible clickable element as the page reports it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub index: usize,
    pub kind: ControlKind,
    pub text: String,
    pub aria_label: String,
    pub value: String,
    pub test_id: String,
}

impl Control {
    /// The strings a learner would use to name the control
    pub fn labels(&self) -> [&str; 4] {
        [&self.text, &self.aria_label, &self.value, &self.test_id]
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Layout {
    pub input: bool,
    pub list: bool,
}

pub struct Session {
    // Dropping the browser kills the Chrome process
    _browser: Browser,
    tab: Arc<Tab>,
}

impl Session {
    pub fn launch() -> anyhow::Result<Self> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            // The grading container drops every capability Chrome's sandbox needs
            .sandbox(false)
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .args(vec![
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--no-first-run"),
            ])
            .build()
            .map_err(|e| anyhow!("invalid browser options: {e}"))?;

        let browser = Browser::new(options).context("unable to start headless Chrome")?;
        let tab = browser.new_tab().context("unable to open a browser tab")?;
        tab.set_default_timeout(NAVIGATION_TIMEOUT);

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Loads `url` and waits until the page has loaded and answers scripts.
    pub fn open(&self, url: &str) -> anyhow::Result<()> {
        let unresponsive = |_: anyhow::Error| PageUnresponsive {
            timeout: NAVIGATION_TIMEOUT,
        };

        self.tab
            .navigate_to(url)
            .with_context(|| format!("unable to open {url}"))?;
        self.tab.wait_until_navigated().map_err(unresponsive)?;
        self.tab
            .evaluate("document.readyState", false)
            .map_err(unresponsive)?;
        Ok(())
    }

    fn eval(&self, script: &str) -> anyhow::Result<Value> {
        let expression = format!("{HELPERS}\n{script}");
        let object = self
            .tab
            .evaluate(&expression, false)
            .context("the page stopped responding to scripts")?;
        Ok(object.value.unwrap_or(Value::Null))
    }

    fn eval_json<T: DeserializeOwned>(&self, script: &str) -> anyhow::Result<T> {
        match self.eval(script)? {
            Value::String(json) => serde_json::from_str(&json)
                .with_context(|| format!("unexpected answer from `{script}`")),
            other => bail!("`{script}` returned {other} instead of JSON"),
        }
    }

    fn eval_bool(&self, script: &str) -> anyhow::Result<bool> {
        match self.eval(script)? {
            Value::Bool(value) => Ok(value),
            other => bail!("`{script}` returned {other} instead of a boolean"),
        }
    }

    pub fn layout(&self) -> anyhow::Result<Layout> {
        self.eval_json("window.__grader.layout()")
    }

    /// Visible controls on the page, or inside the item showing `text`.
    pub fn controls(&self, text: Option<&str>) -> anyhow::Result<Vec<Control>> {
        let scope = match text {
            Some(text) => serde_json::to_string(text)?,
            None => "null".to_string(),
        };
        self.eval_json(&format!("window.__grader.controls({scope})"))
    }

    /// Selects a control from the last [`Session::controls`] call.
    pub fn mark_control(&self, control: &Control) -> anyhow::Result<bool> {
        self.eval_bool(&format!("window.__grader.mark({})", control.index))
    }

    /// Selects the first visible text input.
    pub fn mark_entry(&self) -> anyhow::Result<bool> {
        self.eval_bool("window.__grader.entry()")
    }

    /// Selects the element showing `text`.
    pub fn mark_text(&self, text: &str) -> anyhow::Result<bool> {
        self.eval_bool(&format!("window.__grader.markText({})", serde_json::to_string(text)?))
    }

    pub fn contains(&self, text: &str) -> anyhow::Result<bool> {
        self.eval_bool(&format!("window.__grader.contains({})", serde_json::to_string(text)?))
    }

    /// A snapshot of how the item showing `text` looks, `None` if it is gone.
    pub fn item_state(&self, text: &str) -> anyhow::Result<Option<Vec<String>>> {
        self.eval_json(&format!("window.__grader.state({})", serde_json::to_string(text)?))
    }

    /// Clicks the selected element with real mouse events, falling back to
    /// a DOM click when it cannot be hit.
    pub fn click_marked(&self) -> anyhow::Result<()> {
        let element = self
            .tab
            .find_element(MARKED)
            .context("the selected element disappeared")?;
        if let Err(e) = element.click() {
            log::debug!("Mouse click failed, dispatching a DOM click: {e:#}");
            self.eval(&format!("document.querySelector('{MARKED}').click()"))?;
        }
        Ok(())
    }

    pub fn type_into_marked(&self, text: &str) -> anyhow::Result<()> {
        self.tab
            .find_element(MARKED)
            .context("the text input disappeared")?
            .type_into(text)
            .context("unable to type into the text input")?;
        Ok(())
    }

    pub fn press_enter(&self) -> anyhow::Result<()> {
        self.tab.press_key("Enter").context("unable to press Enter")?;
        Ok(())
    }

    /// Polls `condition` until it holds or [`ACTION_TIMEOUT`] passes.
    pub fn wait_until<F>(&self, mut condition: F) -> anyhow::Result<bool>
    where
        F: FnMut(&Self) -> anyhow::Result<bool>,
    {
        let deadline = Instant::now() + ACTION_TIMEOUT;
        loop {
            if condition(self)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
