use std::{
    io::{stdin, stdout, Write},
    path::{Path, PathBuf},
};

use zeroize::Zeroizing;

pub fn read_from_stdin(hidden: bool, prompt: &str) -> std::io::Result<Zeroizing<String>> {
    if hidden {
        return rpassword::prompt_password(prompt).map(Zeroizing::new);
    }

    print!("{}", prompt);
    stdout().flush()?;
    let mut read = String::new();
    stdin().read_line(&mut read)?;

    Ok(Zeroizing::new(read.trim_end_matches(['\r', '\n']).to_string()))
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Expands a leading `~/` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
