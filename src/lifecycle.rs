//! Install/activate state machine.

use crate::error::LifecycleError;

/// State of the newest generation's lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LifecycleState {
  #[default]
  Uninitialized,
  Installing,
  /// Installed, waiting to activate
  Installed,
  Activating,
  Active,
}

/// Lifecycle bookkeeping.
///
/// `state` tracks the generation being installed or activated. `serving` is
/// the generation fetch events are answered from; it only changes when an
/// activation completes, so a failed install or sweep leaves the prior
/// generation serving.
#[derive(Debug, Default)]
pub struct Lifecycle {
  state: LifecycleState,
  pending: Option<String>,
  serving: Option<String>,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn serving(&self) -> Option<&str> {
    self.serving.as_deref()
  }

  pub fn begin_install(&mut self, generation: &str) -> Result<(), LifecycleError> {
    match self.state {
      LifecycleState::Uninitialized | LifecycleState::Installed | LifecycleState::Active => {
        self.state = LifecycleState::Installing;
        self.pending = Some(generation.to_string());
        Ok(())
      }
      from => Err(LifecycleError::InvalidTransition {
        from,
        event: "install",
      }),
    }
  }

  pub fn finish_install(&mut self, succeeded: bool) -> Result<(), LifecycleError> {
    self.require(LifecycleState::Installing, "finish install")?;
    if succeeded {
      self.state = LifecycleState::Installed;
    } else {
      self.pending = None;
      self.state = self.resting_state();
    }
    Ok(())
  }

  pub fn begin_activate(&mut self) -> Result<String, LifecycleError> {
    self.require(LifecycleState::Installed, "activate")?;
    let generation = self
      .pending
      .clone()
      .ok_or(LifecycleError::InvalidTransition {
        from: self.state,
        event: "activate",
      })?;
    self.state = LifecycleState::Activating;
    Ok(generation)
  }

  pub fn finish_activate(&mut self, succeeded: bool) -> Result<(), LifecycleError> {
    self.require(LifecycleState::Activating, "finish activate")?;
    if succeeded {
      self.serving = self.pending.take();
      self.state = LifecycleState::Active;
    } else {
      self.state = LifecycleState::Installed;
    }
    Ok(())
  }

  /// Serve an already-installed generation found in the store.
  pub fn resume(&mut self, generation: &str) -> Result<(), LifecycleError> {
    match self.state {
      LifecycleState::Uninitialized | LifecycleState::Active => {
        self.serving = Some(generation.to_string());
        self.state = LifecycleState::Active;
        Ok(())
      }
      from => Err(LifecycleError::InvalidTransition {
        from,
        event: "resume",
      }),
    }
  }

  fn resting_state(&self) -> LifecycleState {
    if self.serving.is_some() {
      LifecycleState::Active
    } else {
      LifecycleState::Uninitialized
    }
  }

  fn require(&self, state: LifecycleState, event: &'static str) -> Result<(), LifecycleError> {
    if self.state == state {
      Ok(())
    } else {
      Err(LifecycleError::InvalidTransition {
        from: self.state,
        event,
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_happy_path() {
    let mut lc = Lifecycle::new();
    assert_eq!(lc.state(), LifecycleState::Uninitialized);

    lc.begin_install("app-v1").unwrap();
    assert_eq!(lc.state(), LifecycleState::Installing);
    lc.finish_install(true).unwrap();
    assert_eq!(lc.state(), LifecycleState::Installed);
    assert_eq!(lc.serving(), None);

    assert_eq!(lc.begin_activate().unwrap(), "app-v1");
    assert_eq!(lc.state(), LifecycleState::Activating);
    lc.finish_activate(true).unwrap();
    assert_eq!(lc.state(), LifecycleState::Active);
    assert_eq!(lc.serving(), Some("app-v1"));
  }

  #[test]
  fn test_failed_install_keeps_prior_generation() {
    let mut lc = Lifecycle::new();
    lc.resume("app-v1").unwrap();

    lc.begin_install("app-v2").unwrap();
    lc.finish_install(false).unwrap();
    assert_eq!(lc.state(), LifecycleState::Active);
    assert_eq!(lc.serving(), Some("app-v1"));
    assert!(lc.begin_activate().is_err());
  }

  #[test]
  fn test_failed_first_install_returns_to_uninitialized() {
    let mut lc = Lifecycle::new();
    lc.begin_install("app-v1").unwrap();
    lc.finish_install(false).unwrap();
    assert_eq!(lc.state(), LifecycleState::Uninitialized);
  }

  #[test]
  fn test_failed_activation_stays_installed() {
    let mut lc = Lifecycle::new();
    lc.resume("app-v1").unwrap();
    lc.begin_install("app-v2").unwrap();
    lc.finish_install(true).unwrap();
    lc.begin_activate().unwrap();
    lc.finish_activate(false).unwrap();

    assert_eq!(lc.state(), LifecycleState::Installed);
    assert_eq!(lc.serving(), Some("app-v1"));

    // Activation can be retried
    assert_eq!(lc.begin_activate().unwrap(), "app-v2");
  }

  #[test]
  fn test_invalid_transitions() {
    let mut lc = Lifecycle::new();
    assert_eq!(
      lc.begin_activate(),
      Err(LifecycleError::InvalidTransition {
        from: LifecycleState::Uninitialized,
        event: "activate",
      })
    );
    lc.begin_install("app-v1").unwrap();
    assert!(lc.begin_install("app-v1").is_err());
    assert!(lc.finish_activate(true).is_err());
  }
}
