use edged::config::EdgedConfig;
use edged::daemon::TreeSnapshot;
use edged::http_server::command_path;
use edged::workloads::build_default_tree;

pub(crate) fn cmd_commands() -> anyhow::Result<()> {
    let config = EdgedConfig::load()?;
    let root = build_default_tree(&config, None)?;

    println!("{}", TreeSnapshot::capture(&root).outline());

    for (name, command) in root.get_commands() {
        let target = command
            .target_state()
            .map(|s| s.state_name().to_string())
            .unwrap_or_else(|_| "-".to_string());
        println!("{:<16} {:<8} POST {}", name, target, command_path(&command));
    }

    Ok(())
}
