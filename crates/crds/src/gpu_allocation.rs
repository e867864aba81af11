//! GPU allocation annotation codec
//!
//! The device plugin records the devices bound to a pod as
//! `uuid,vendor,memory,cores:` records terminated by `;`.
//! An empty allocation encodes as a bare `;`.

use crate::error::ParseError;

const RECORD_SEPARATOR: char = ':';
const FIELD_SEPARATOR: char = ',';
const TERMINATOR: &str = ";";

/// A single GPU slice assigned to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDevice {
    /// Device UUID
    pub uuid: String,
    /// Vendor type, e.g. "NVIDIA"
    pub vendor: String,
    /// Device memory in MiB
    pub memory: i64,
    /// Core percentage
    pub cores: i32,
}

/// Decodes an allocation annotation value.
pub fn decode_devices(value: &str) -> Result<Vec<ContainerDevice>, ParseError> {
    let mut devices = Vec::new();
    for record in value.split(RECORD_SEPARATOR) {
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
        if fields[0] == TERMINATOR {
            break;
        }
        if fields.len() != 4 {
            return Err(ParseError::InvalidDeviceRecord(record.to_string()));
        }
        let memory = fields[2].parse::<i64>().map_err(|_| ParseError::InvalidNumber {
            field: "memory",
            value: fields[2].to_string(),
        })?;
        let cores = fields[3].parse::<i32>().map_err(|_| ParseError::InvalidNumber {
            field: "cores",
            value: fields[3].to_string(),
        })?;
        devices.push(ContainerDevice {
            uuid: fields[0].to_string(),
            vendor: fields[1].to_string(),
            memory,
            cores,
        });
    }
    Ok(devices)
}

/// Encodes devices into the annotation format.
pub fn encode_devices(devices: &[ContainerDevice]) -> String {
    let mut out = String::new();
    for d in devices {
        out.push_str(&format!(
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{RECORD_SEPARATOR}",
            d.uuid, d.vendor, d.memory, d.cores
        ));
    }
    out.push_str(TERMINATOR);
    out
}

/// Rewrites the memory of every record, returning the re-encoded value.
pub fn rewrite_memory(value: &str, memory: i64) -> Result<String, ParseError> {
    let mut devices = decode_devices(value)?;
    for d in &mut devices {
        d.memory = memory;
    }
    Ok(encode_devices(&devices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_two_devices() {
        let devices = decode_devices("GPU-a,NVIDIA,4000,30:GPU-b,NVIDIA,8000,50:;").unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uuid, "GPU-a");
        assert_eq!(devices[1].memory, 8000);
        assert_eq!(devices[1].cores, 50);
        assert_eq!(encode_devices(&devices), "GPU-a,NVIDIA,4000,30:GPU-b,NVIDIA,8000,50:;");
    }

    #[test]
    fn test_empty_allocation_is_terminator() {
        assert_eq!(encode_devices(&[]), ";");
        assert!(decode_devices(";").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            decode_devices("GPU-a,NVIDIA,4000:;"),
            Err(ParseError::InvalidDeviceRecord(_))
        ));
        assert!(matches!(
            decode_devices("GPU-a,NVIDIA,lots,30:;"),
            Err(ParseError::InvalidNumber { field: "memory", .. })
        ));
        assert!(decode_devices("").is_err());
    }

    #[test]
    fn test_rewrite_memory() {
        let rewritten = rewrite_memory("GPU-a,NVIDIA,4000,30:;", 12000).unwrap();
        assert_eq!(rewritten, "GPU-a,NVIDIA,12000,30:;");
    }
}
