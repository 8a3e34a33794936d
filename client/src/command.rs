use tandem_proto::parse_time;

/// A line typed at the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Pause,
    Seek(i64),
    Resync,
    Status,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "play" | "p" => Command::Play,
        "pause" => Command::Pause,
        "seek" | "s" => {
            let target = words.next().ok_or("usage: seek <mm:ss|ms>")?;
            let target = parse_time(target).ok_or_else(|| format!("invalid time {target:?}"))?;
            Command::Seek(target)
        }
        "resync" | "r" => Command::Resync,
        "status" | "st" => Command::Status,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command {other:?}")),
    };

    if words.next().is_some() {
        return Err(format!("too many arguments for {verb}"));
    }
    Ok(command)
}
