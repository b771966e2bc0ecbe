//! Template-driven pack/unpack through the language surface.

use perlite::{CollectStringPrint, Interp};
use pretty_assertions::assert_eq;

fn run_ok(src: &str) -> String {
    let mut interp = Interp::new();
    let writer = CollectStringPrint::new();
    let (out, _err) = writer.buffers();
    interp.set_writer(Box::new(writer));
    if let Err(e) = interp.run_source(src, "t.pl") {
        panic!("program failed: {e}\nsource:\n{src}");
    }
    let result = out.borrow().clone();
    result
}

#[test]
fn fixed_width_round_trip() {
    let src = "my $p = pack('N n C', 70000, 513, 9); print join(',', unpack('N n C', $p));";
    assert_eq!(run_ok(src), "70000,513,9");
    let src = "my $p = pack('l', -5); print unpack('l', $p);";
    assert_eq!(run_ok(src), "-5");
}

#[test]
fn hexdump_of_big_endian() {
    assert_eq!(run_ok("print unpack('H*', pack('N', 3));"), "00000003");
    assert_eq!(run_ok("print unpack('H*', pack('v', 0x0102));"), "0201");
    assert_eq!(run_ok("print unpack('H*', pack('s>', 1));"), "0001");
}

#[test]
fn string_formats_pad_and_strip() {
    assert_eq!(run_ok("print unpack('H*', pack('a4', 'ab'));"), "61620000");
    assert_eq!(run_ok("print '[', unpack('A5', \"ab  \\0\"), ']';"), "[ab]");
    assert_eq!(run_ok("print unpack('Z5', pack('a5', \"ab\\0cd\"));"), "ab");
    assert_eq!(run_ok("print unpack('b8', pack('C', 0x81));"), "10000001");
    assert_eq!(run_ok("print unpack('H2', pack('C', 0xfd));"), "fd");
}

#[test]
fn slash_constructs() {
    assert_eq!(run_ok("print unpack('H*', pack('N/S', 1, 2, 3));"), "00000003010002000300");
    assert_eq!(run_ok("print join(',', unpack('N/S', pack('N/S', 1, 2, 3)));"), "1,2,3");
    assert_eq!(run_ok("print unpack('C/a', pack('C/a*', 'hello'));"), "hello");
}

#[test]
fn groups_and_endianness() {
    assert_eq!(run_ok("print unpack('H*', pack('(CC)2', 1, 2, 3, 4));"), "01020304");
    assert_eq!(run_ok("print unpack('H*', pack('(s s)>', 1, 2));"), "00010002");
    assert_eq!(run_ok("print join(',', unpack('(C)*', pack('C3', 7, 8, 9)));"), "7,8,9");
}

#[test]
fn position_controls() {
    assert_eq!(run_ok("print unpack('H*', pack('C x2 C', 1, 2));"), "01000002");
    assert_eq!(run_ok("print unpack('H*', pack('C @3 C', 1, 2));"), "01000002");
    assert_eq!(run_ok("print unpack('H*', pack('x[s2]'));"), "00000000");
    assert_eq!(run_ok("my ($a, $b) = unpack('C X C', pack('C', 7)); print \"$a,$b\";"), "7,7");
}

#[test]
fn mode_switches_and_unicode() {
    assert_eq!(run_ok("print unpack('H*', pack('C0 W', 253));"), "fd");
    assert_eq!(run_ok("print unpack('H*', pack('U', 0x100));"), "c480");
    assert_eq!(run_ok("print unpack('U', pack('U', 0x263A));"), "9786");
    assert_eq!(run_ok("print unpack('W', \"\\x{100}\");"), "256");
}

#[test]
fn ber_compressed_integers() {
    assert_eq!(run_ok("print unpack('H*', pack('w', 128));"), "8100");
    assert_eq!(run_ok("print join(',', unpack('w w', pack('w w', 0, 300)));"), "0,300");
}

#[test]
fn checksums() {
    assert_eq!(run_ok("print unpack('%16C*', pack('C2', 250, 250));"), "500");
    assert_eq!(run_ok("print unpack('%8C*', pack('C2', 250, 250));"), "244");
    assert_eq!(run_ok("print unpack('%16C*', '');"), "0");
}

#[test]
fn uuencode_round_trip() {
    let src = "my $u = pack('u', 'Hello, world!'); print unpack('u', $u);";
    assert_eq!(run_ok(src), "Hello, world!");
}

#[test]
fn star_in_bracket_is_fatal_with_perl_wording() {
    let src = "eval { my @v = unpack('x[s<*]', 'data') }; print $@;";
    let out = run_ok(src);
    assert!(out.contains("Within []-length '*' not allowed in unpack"), "unexpected: {out}");
}

#[test]
fn slash_after_nonnumeric_is_fatal() {
    let src = "eval { pack('(N)/S', 1) }; print $@;";
    let out = run_ok(src);
    assert!(out.contains("'/' must follow a numeric type in pack"), "unexpected: {out}");
}

#[test]
fn float_round_trip_within_precision() {
    assert_eq!(run_ok("print unpack('d', pack('d', 2.5));"), "2.5");
    let src = "my ($f) = unpack('f', pack('f', 1.5)); print $f;";
    assert_eq!(run_ok(src), "1.5");
}
