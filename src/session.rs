use std::time::Duration;

use crate::bridge::GRAPH_INIT_SCRIPT;
use crate::driver::{DriverError, SessionDriver};

pub type Result<T> = std::result::Result<T, SessionError>;

/// How long to wait for a session host to admit us.
const ADMIT_TIMEOUT: Duration = Duration::from_secs(120);
/// Cadence of the admission check.
const ADMIT_POLL: Duration = Duration::from_secs(2);
/// Join-button labels tried in order. The session UI is English-locale.
const JOIN_BUTTON_LABELS: &[&str] = &["Join now", "Ask to join", "Join"];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SessionError {
    Driver(DriverError),
    /// The lobby page rendered without any recognizable join control.
    JoinButtonNotFound,
    /// Nobody admitted us within the wait bound.
    AdmitTimeout,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Driver(e) => write!(f, "session driver: {e}"),
            SessionError::JoinButtonNotFound => write!(f, "no join button found on the page"),
            SessionError::AdmitTimeout => write!(f, "not admitted to the session in time"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DriverError> for SessionError {
    fn from(e: DriverError) -> Self {
        SessionError::Driver(e)
    }
}

// ---------------------------------------------------------------------------
// Link validation
// ---------------------------------------------------------------------------

/// Normalize a user-supplied session link to canonical form, rejecting
/// anything that is not a meet.google.com room.
pub fn normalize_meet_link(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let rest = trimmed
        .strip_prefix("https://meet.google.com/")
        .or_else(|| trimmed.strip_prefix("http://meet.google.com/"))
        .or_else(|| trimmed.strip_prefix("meet.google.com/"))?;

    let code = rest.split(['?', '#']).next().unwrap_or("").trim_end_matches('/');
    if code.is_empty() {
        return None;
    }
    let valid = code
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return None;
    }

    Some(format!("https://meet.google.com/{code}"))
}

// ---------------------------------------------------------------------------
// Join / leave flow
// ---------------------------------------------------------------------------

/// Drive the full join flow: navigate to the lobby, request entry, wait for
/// admission, then settle in (camera off, graph installed, noise processing
/// off).
pub async fn join_meeting<D: SessionDriver>(driver: &D, link: &str) -> Result<()> {
    driver.connect().await?;

    // Install before navigation so getUserMedia is already patched when the
    // lobby asks for devices.
    driver.install_init_script(GRAPH_INIT_SCRIPT).await?;

    tracing::info!("[session] navigating to {link}");
    driver.navigate(link).await?;
    tokio::time::sleep(Duration::from_secs(6)).await;

    // Belt and braces: the init script only applies to documents loaded
    // after registration.
    if let Err(e) = driver.execute(GRAPH_INIT_SCRIPT).await {
        tracing::warn!("[session] graph injection on lobby failed: {e}");
    }

    let mut clicked = false;
    for label in JOIN_BUTTON_LABELS {
        if driver.locate_and_click("button", label, 3_000).await? {
            tracing::info!("[session] clicked '{label}'");
            clicked = true;
            break;
        }
    }
    if !clicked {
        return Err(SessionError::JoinButtonNotFound);
    }

    wait_for_admission(driver).await?;
    tracing::info!("[session] admitted");
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Best-effort tidying; none of these are fatal.
    if driver
        .locate_and_click("button", "Turn off camera", 2_000)
        .await
        .unwrap_or(false)
    {
        tracing::info!("[session] camera turned off");
    }
    if let Err(e) = driver.execute(GRAPH_INIT_SCRIPT).await {
        tracing::warn!("[session] graph injection in call failed: {e}");
    }
    disable_noise_processing(driver).await;

    Ok(())
}

/// Poll for the in-call UI until admitted or timed out.
async fn wait_for_admission<D: SessionDriver>(driver: &D) -> Result<()> {
    const IN_CALL_MARKER: &str = r#"(() =>
  !!document.querySelector('[aria-label*="Leave call"]') ||
  !!document.querySelector('[data-call-ended]')
)()"#;

    let deadline = tokio::time::Instant::now() + ADMIT_TIMEOUT;
    tracing::info!(
        "[session] waiting up to {}s for admission",
        ADMIT_TIMEOUT.as_secs()
    );

    loop {
        match driver.execute(IN_CALL_MARKER).await {
            Ok(v) if v.as_bool() == Some(true) => return Ok(()),
            Ok(_) => {}
            Err(e) => tracing::debug!("[session] admission probe failed: {e}"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SessionError::AdmitTimeout);
        }
        tokio::time::sleep(ADMIT_POLL).await;
    }
}

/// The conference's own noise suppression eats music. Turning it off walks
/// More options -> Settings -> Audio and flips the suppression switch; every
/// step is best-effort since the settings UI shifts between releases.
async fn disable_noise_processing<D: SessionDriver>(driver: &D) {
    let opened = driver
        .locate_and_click("button", "More options", 2_000)
        .await
        .unwrap_or(false)
        && driver
            .locate_and_click("li", "Settings", 2_000)
            .await
            .unwrap_or(false);
    if !opened {
        tracing::info!("[session] settings menu not reachable, leaving noise processing as-is");
        return;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    const FLIP_SUPPRESSION: &str = r#"(() => {
  const toggles = Array.from(document.querySelectorAll('[role="switch"]'));
  const hit = toggles.find((el) =>
    ((el.getAttribute("aria-label") || "") + (el.innerText || ""))
      .toLowerCase()
      .includes("noise")
  );
  if (hit && hit.getAttribute("aria-checked") === "true") {
    hit.click();
    return true;
  }
  return false;
})()"#;

    match driver.execute(FLIP_SUPPRESSION).await {
        Ok(v) if v.as_bool() == Some(true) => {
            tracing::info!("[session] noise suppression disabled");
        }
        Ok(_) => tracing::info!("[session] noise suppression already off or not found"),
        Err(e) => tracing::warn!("[session] noise suppression toggle failed: {e}"),
    }

    // Close the dialog and any menu left open.
    driver.press_key("Escape").await.ok();
    driver.press_key("Escape").await.ok();
}

pub async fn leave_meeting<D: SessionDriver>(driver: &D) -> Result<()> {
    if !driver.locate_and_click("button", "Leave call", 3_000).await? {
        tracing::info!("[session] no leave button, navigating away");
    }
    driver.navigate("about:blank").await?;
    Ok(())
}

/// Flip the conference's own microphone control. The desired state is what
/// the orchestrator says it is; if the matching button is absent the UI is
/// already there.
pub async fn set_mic_muted<D: SessionDriver>(driver: &D, muted: bool) -> Result<()> {
    let label = if muted {
        "Turn off microphone"
    } else {
        "Turn on microphone"
    };
    if driver.locate_and_click("button", label, 3_000).await? {
        tracing::info!("[session] mic now {}", if muted { "muted" } else { "live" });
    } else {
        tracing::info!("[session] mic already in desired state");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    #[test]
    fn test_normalize_accepts_canonical_and_bare_links() {
        assert_eq!(
            normalize_meet_link("https://meet.google.com/abc-defg-hij"),
            Some("https://meet.google.com/abc-defg-hij".into())
        );
        assert_eq!(
            normalize_meet_link("meet.google.com/abc-defg-hij"),
            Some("https://meet.google.com/abc-defg-hij".into())
        );
        assert_eq!(
            normalize_meet_link(" https://meet.google.com/abc-defg-hij?hs=122 "),
            Some("https://meet.google.com/abc-defg-hij".into())
        );
    }

    #[test]
    fn test_normalize_rejects_foreign_or_malformed_links() {
        assert!(normalize_meet_link("https://example.com/abc-defg-hij").is_none());
        assert!(normalize_meet_link("https://meet.google.com/").is_none());
        assert!(normalize_meet_link("https://meet.google.com/ABC DEF").is_none());
        assert!(normalize_meet_link("not a link").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_clicks_button_and_installs_graph() {
        let driver = MockDriver::new();
        // Admission probe and graph injections all return Null by default;
        // make the probe succeed by answering true.
        *driver.response.lock().unwrap() = serde_json::Value::Bool(true);

        join_meeting(&driver, "https://meet.google.com/abc-defg-hij")
            .await
            .unwrap();

        assert_eq!(
            driver.navigations.lock().unwrap().as_slice(),
            ["https://meet.google.com/abc-defg-hij"]
        );
        let clicks = driver.clicks.lock().unwrap();
        assert!(clicks.iter().any(|(_, label)| label == "Join now"));
        assert!(driver.scripts().iter().any(|s| s.contains("__jam_injected")));
    }

    #[tokio::test]
    async fn test_set_mic_muted_picks_label_by_direction() {
        let driver = MockDriver::new();
        set_mic_muted(&driver, true).await.unwrap();
        set_mic_muted(&driver, false).await.unwrap();

        let clicks = driver.clicks.lock().unwrap();
        assert_eq!(clicks[0].1, "Turn off microphone");
        assert_eq!(clicks[1].1, "Turn on microphone");
    }
}
