use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!addr!port` style address into the protocol and the
/// address the corresponding listener/dialer expects: `host:port` for
/// tcp, a filesystem path for unix.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;
    let addr = split.next()?;

    match (proto, split.next()) {
        ("tcp", Some(port)) => Some((proto, format!("{}:{}", addr, port))),
        ("unix", _) => Some((proto, addr.to_owned())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_proto;

    #[test]
    fn parse_proto_forms() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1:564".to_owned()))
        );
        assert_eq!(
            parse_proto("unix!/tmp/ninep.sock"),
            Some(("unix", "/tmp/ninep.sock".to_owned()))
        );
        assert_eq!(parse_proto("tcp!127.0.0.1"), None);
        assert_eq!(parse_proto("9fans.net"), None);
    }
}
