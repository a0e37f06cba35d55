//! Parsing of storage-server dial strings.
//!
//! Dial strings are the compact CLI form for a storage cluster:
//! `<ip>:<port>[@<db>][,<ip>:<port>[@<db>]]*`. The database index is
//! optional; if the text after the last `@` does not parse as an integer it
//! is considered part of the address. Whitespace around entries and
//! trailing commas are tolerated.

use crate::{Error, StorageServerConfig};
use std::net::SocketAddr;

/// Parses a comma-separated list of dial strings into server configs.
///
/// Every parsed server starts in the `Online` state; dial strings carry no
/// state information.
pub fn parse_server_configs(raw: &str) -> Result<Vec<StorageServerConfig>, Error> {
    let mut configs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (address, database) = match entry.rsplit_once('@') {
            Some((address, suffix)) => match suffix.parse::<u16>() {
                Ok(database) => (address, database),
                // Not a database index, so it must be part of the address.
                Err(_) => (entry, 0),
            },
            None => (entry, 0),
        };

        let address = address
            .parse::<SocketAddr>()
            .map_err(|_| Error::InvalidAddress(address.to_string()))?;
        let mut config = StorageServerConfig::new(address);
        config.database = database;
        configs.push(config);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerState;

    #[test]
    fn test_empty() {
        assert!(parse_server_configs("").unwrap().is_empty());
        assert!(parse_server_configs(" , ,, ").unwrap().is_empty());
    }

    #[test]
    fn test_single() {
        let configs = parse_server_configs("127.0.0.1:16379").unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].address, "127.0.0.1:16379".parse().unwrap());
        assert_eq!(configs[0].database, 0);
        assert_eq!(configs[0].state, ServerState::Online);
    }

    #[test]
    fn test_with_database() {
        let configs = parse_server_configs("127.0.0.1:16379@4").unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].database, 4);
    }

    #[test]
    fn test_multiple_with_whitespace_and_trailing_comma() {
        let configs =
            parse_server_configs(" 127.0.0.1:16379@1 , 127.0.0.1:16380 ,127.0.0.1:16381@2,")
                .unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[0].database, 1);
        assert_eq!(configs[1].database, 0);
        assert_eq!(configs[2].database, 2);
    }

    #[test]
    fn test_non_integer_suffix_is_part_of_address() {
        // `@foo` is not a database index, so the full entry is treated as an
        // address (and rejected, since it is not a valid one).
        let err = parse_server_configs("127.0.0.1:16379@foo").unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(addr) if addr == "127.0.0.1:16379@foo"));
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            parse_server_configs("not-an-address"),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_roundtrip() {
        // For any valid combination, formatting and re-parsing yields the
        // original list.
        let original = parse_server_configs("10.0.0.1:1000,10.0.0.2:1001@7,10.0.0.3:1002@0").unwrap();
        let joined = original
            .iter()
            .map(|cfg| {
                if cfg.database == 0 {
                    cfg.address.to_string()
                } else {
                    format!("{}@{}", cfg.address, cfg.database)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let reparsed = parse_server_configs(&joined).unwrap();
        assert_eq!(original, reparsed);
    }
}
