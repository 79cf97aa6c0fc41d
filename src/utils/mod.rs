use std::io::{self, BufRead, Write};

/// Prompt for a yes/no answer on stdin. Returns `false` when the user
/// declines or closes the stream.
pub fn confirm(prompt: &str) -> io::Result<bool> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("{} y|n: ", prompt);
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim() {
            "y" | "Y" => return Ok(true),
            "n" | "N" => return Ok(false),
            _ => println!("please enter y or n."),
        }
    }
}

/// Normalize an AS token from external datasets: uppercase and strip a
/// leading "AS" (e.g. "as65000" -> "65000").
pub fn normalize_asn_token(token: &str) -> String {
    let upper = token.trim().to_uppercase();
    match upper.strip_prefix("AS") {
        Some(rest) => rest.to_string(),
        None => upper,
    }
}

/// The file-name portion of a path, used to tag ingested records with
/// their source.
pub fn basename(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_asn_token() {
        assert_eq!(normalize_asn_token("AS65000"), "65000");
        assert_eq!(normalize_asn_token("as65000"), "65000");
        assert_eq!(normalize_asn_token(" 65000 "), "65000");
        assert_eq!(normalize_asn_token("65000"), "65000");
    }
}
