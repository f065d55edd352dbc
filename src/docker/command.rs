/// Builds the argv executed inside the container for one workload.
///
/// A single-word entrypoint (`/ros_entrypoint.sh`) is followed by the
/// command words. A multi-word entrypoint such as `/bin/bash -c` expects the
/// whole command as one string, so the command is shell-quoted and joined.
pub fn containerized_command(entrypoint: &str, command: &[String]) -> Vec<String> {
    let mut argv: Vec<String> = entrypoint.split_whitespace().map(str::to_string).collect();

    if argv.len() > 1 {
        let joined = command
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        argv.push(joined);
    } else {
        argv.extend(command.iter().cloned());
    }

    argv
}

/// Quote a single argument for POSIX shells.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
