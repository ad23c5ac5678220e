use std::fmt;

/// Represents a command the proxy itself sends to an upstream, as opposed
/// to frames relayed on behalf of clients.  Arguments are accumulated and
/// packed into a RESP array of bulk strings.
#[derive(Clone, Default)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
}

/// Shortcut function to creating a command with a single argument.
///
/// The first argument of a command is always the name of the command.
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd { args: vec![] }
    }

    /// Appends an argument to the command.
    pub fn arg(&mut self, arg: impl ToCmdArg) -> &mut Cmd {
        self.args.push(arg.to_cmd_arg());
        self
    }

    /// Returns the packed wire representation of the command.
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut buf = itoa::Buffer::new();
        let mut out = Vec::with_capacity(self.packed_len());

        out.extend_from_slice(b"*");
        out.extend_from_slice(buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");

        for arg in &self.args {
            out.extend_from_slice(b"$");
            out.extend_from_slice(buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    fn packed_len(&self) -> usize {
        let mut totlen = 1 + countdigits(self.args.len()) + 2;
        for arg in &self.args {
            totlen += 1 + countdigits(arg.len()) + 2 + arg.len() + 2;
        }
        totlen
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<_> = self
            .args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg))
            .collect();
        write!(f, "Cmd({})", parts.join(" "))
    }
}

/// Conversion of argument types into command arguments.
pub trait ToCmdArg {
    /// Returns the wire bytes of the argument.
    fn to_cmd_arg(&self) -> Vec<u8>;
}

impl ToCmdArg for &str {
    fn to_cmd_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToCmdArg for String {
    fn to_cmd_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToCmdArg for &[u8] {
    fn to_cmd_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl ToCmdArg for i64 {
    fn to_cmd_arg(&self) -> Vec<u8> {
        let mut buf = itoa::Buffer::new();
        buf.format(*self).as_bytes().to_vec()
    }
}

fn countdigits(mut v: usize) -> usize {
    let mut result = 1;
    loop {
        if v < 10 {
            return result;
        }
        if v < 100 {
            return result + 1;
        }
        if v < 1000 {
            return result + 2;
        }
        if v < 10000 {
            return result + 3;
        }

        v /= 10000;
        result += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_args_as_bulk_strings() {
        let mut c = cmd("SELECT");
        c.arg(3i64);
        assert_eq!(c.get_packed_command(), b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n");
    }

    #[test]
    fn packs_binary_args() {
        let mut c = cmd("GET");
        c.arg(&b"\x00\xffkey"[..]);
        assert_eq!(
            c.get_packed_command(),
            b"*2\r\n$3\r\nGET\r\n$5\r\n\x00\xffkey\r\n"
        );
    }
}
