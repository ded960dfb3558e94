use crate::core::config::Config;
use crate::core::state::Mode;
use anyhow::Result;
use inquire::Select;
use log::warn;

/// Fills in settings the pipeline needs before the first run. Returns the
/// mode to use; asks once and saves the answer when interactive.
pub fn run_setup(config: &mut Config) -> Result<Mode> {
    if let Some(mode) = config.generation.mode {
        return Ok(mode);
    }

    if config.unattended {
        warn!("generation.mode not set; defaulting to {} for unattended run", Mode::Male);
        return Ok(Mode::Male);
    }

    let mode = select_mode()?;
    config.generation.mode = Some(mode);
    config.save()?;
    println!("Saved channel selection: {}", mode);
    Ok(mode)
}

fn select_mode() -> Result<Mode> {
    let options = vec![Mode::Male, Mode::Female];
    let ans = Select::new("Select target channel:", options).prompt()?;
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        Config::parse(yaml).unwrap()
    }

    #[test]
    fn test_configured_mode_is_used() {
        let mut cfg = config("llm:\n  provider: gemini\ngeneration:\n  mode: female\n");
        assert_eq!(run_setup(&mut cfg).unwrap(), Mode::Female);
    }

    #[test]
    fn test_unattended_defaults_to_male_without_saving() {
        let mut cfg = config("llm:\n  provider: gemini\nunattended: true\n");
        assert_eq!(run_setup(&mut cfg).unwrap(), Mode::Male);
        assert!(cfg.generation.mode.is_none());
    }
}
