use edged::config::EdgedConfig;

pub(crate) fn cmd_config(write: bool) -> anyhow::Result<()> {
    let config = EdgedConfig::load()?;
    let path = EdgedConfig::config_path();

    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    println!(
        "# effective: poll_timeout = {}ms, failure_policy = {}",
        config.poll_timeout().as_millis(),
        config.failure_policy()
    );

    if write {
        config.save_to(&path)?;
        println!("# written to {}", path.display());
    }

    Ok(())
}
