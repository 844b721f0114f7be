//! shell 命令行拼接
use std::borrow::Cow;
use std::path::Path;
use std::process::Command;

use shell_escape::unix::escape;

/// 为 `sh -c` 引用单个参数；不含特殊字符时原样返回
pub fn quote(arg: &str) -> String {
    escape(Cow::Borrowed(arg)).into_owned()
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// 用作临时目录名的一部分
pub fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

/// 构造经由系统 shell 执行的命令
pub fn shell_command(command_line: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(target_os = "windows"))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_are_left_alone() {
        assert_eq!(quote("main"), "main");
        assert_eq!(quote("/tmp/drunner-scout.x1tmp/srcs"), "/tmp/drunner-scout.x1tmp/srcs");
    }

    #[test]
    fn metacharacters_are_quoted() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("git@github.com:org/repo.git"), "'git@github.com:org/repo.git'");
    }

    #[test]
    fn sanitize_keeps_only_path_safe_characters() {
        assert_eq!(sanitize("scout"), "scout");
        assert_eq!(sanitize("../my scanner"), "___my_scanner");
    }
}
