use std::net::{IpAddr, Ipv4Addr};

use firmware_action::ErrorKind;
use firmware_action::container::ssh::parse_address;
use firmware_action::modules::stitching::{extract_size, inflate};

const IFDTOOL_DUMP: &str = "\
File descriptor.bin is 4096 bytes

FLMAP0:    0x03040003
  NR:      0
  FRBA:    0x40
  NC:      1
  FCBA:    0x30
FLCOMP:    0x12f00025
  Component 2 Density: 512KB
  Component 1 Density: 8MB
";

#[test]
fn base_image_is_padded_to_declared_flash_size() {
    let [c1, c2] = extract_size(IFDTOOL_DUMP).expect("sizes");
    assert_eq!(c1, 8 << 20);
    assert_eq!(c2, 512 << 10);

    let base = vec![0x5Au8; 4096];
    let image = inflate(&base, c1 + c2).expect("inflate");
    assert_eq!(image.len() as u64, c1 + c2);
    assert_eq!(&image[..4096], base.as_slice());
    assert!(image[4096..].iter().all(|&b| b == 0xFF));
}

#[test]
fn oversized_base_image_is_refused() {
    let err = inflate(&[0u8; 32], 16).unwrap_err();
    assert!(err.is(ErrorKind::BaseFileBiggerThanIfd), "{err}");
}

#[test]
fn published_port_addresses() {
    assert_eq!(
        parse_address("0.0.0.0:49153").unwrap(),
        (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 49153)
    );
    assert_eq!(
        parse_address("[::1]:2222").unwrap(),
        ("::1".parse::<IpAddr>().unwrap(), 2222)
    );
    assert!(parse_address(":22").unwrap_err().is(ErrorKind::ParseAddress));
}
