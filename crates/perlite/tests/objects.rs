//! Packages, method dispatch, inheritance, overload, tie, and the class
//! feature desugar.

use perlite::{CollectStringPrint, Interp};

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
fn bless_and_method_dispatch() {
    let src = r#"
package Animal;
sub new {
    my ($class, %args) = @_;
    return bless { name => $args{name} }, $class;
}
sub name { my $self = shift; return $self->{name} }
sub speak { my $self = shift; return $self->name . ' makes a sound' }

package main;
my $a = Animal->new(name => 'Generic');
print $a->speak;
"#;
    assert_eq!(run_ok(src), "Generic makes a sound");
}

#[test]
fn isa_inheritance_and_super() {
    let src = r#"
package Animal;
sub new { my ($class, %args) = @_; return bless { %args }, $class }
sub speak { my $self = shift; return $self->{name} . ' speaks' }

package Dog;
our @ISA = ('Animal');
sub new {
    my ($class, %args) = @_;
    my $self = $class->SUPER::new(%args);
    $self->{kind} = 'dog';
    return $self;
}
sub speak { my $self = shift; return $self->SUPER::speak() . ' (woof)' }

package main;
my $d = Dog->new(name => 'Rex');
print $d->speak, ':', $d->{kind}, ':', ref($d);
"#;
    assert_eq!(run_ok(src), "Rex speaks (woof):dog:Dog");
}

#[test]
fn universal_can_and_isa() {
    let src = r#"
package Cat;
sub new { return bless {}, shift }
sub purr { 'prr' }
package main;
my $c = Cat->new;
print $c->isa('Cat') ? 'y' : 'n';
print defined $c->can('purr') ? 'y' : 'n';
print defined $c->can('bark') ? 'y' : 'n';
"#;
    assert_eq!(run_ok(src), "yyn");
}

#[test]
fn method_resolution_failure_dies() {
    let src = "package P; sub new { bless {}, shift } package main; my $p = P->new; eval { $p->missing }; print $@;";
    let out = run_ok(src);
    assert!(
        out.contains("Can't locate object method \"missing\" via package \"P\""),
        "unexpected: {out}"
    );
}

#[test]
fn operator_overloading() {
    let src = r#"
package Vec1;
use overload
    '+' => sub { my ($a, $b) = @_; return Vec1->new($a->{x} + $b->{x}) },
    '""' => sub { my $self = shift; return 'V' . $self->{x} };
sub new { my ($class, $x) = @_; return bless { x => $x }, $class }

package main;
my $v = Vec1->new(1) + Vec1->new(2);
print "$v";
"#;
    assert_eq!(run_ok(src), "V3");
}

#[test]
fn tie_scalar_routes_fetch() {
    let src = r#"
package Counter;
sub TIESCALAR { my $n = 0; return bless \$n, shift }
sub FETCH { my $self = shift; $$self += 1; return $$self }
sub STORE { }

package main;
tie my $t, 'Counter';
print $t, $t, $t;
"#;
    assert_eq!(run_ok(src), "123");
}

#[test]
fn class_feature_desugars() {
    let src = r#"
use feature 'class';
no warnings;
class Point {
    field $x :param :reader;
    field $y :param :reader = 0;
    method sum { return $x + $y }
    method moved { return Point->new(x => $x + 1, y => $y + 1) }
}
my $p = Point->new(x => 3, y => 4);
print $p->sum, ':', $p->x, ':', $p->y, ':';
my $q = Point->new(x => 9);
print $q->sum, ':';
my $m = $p->moved;
print $m->sum;
"#;
    assert_eq!(run_ok(src), "7:3:4:9:9");
}

#[test]
fn class_adjust_runs_in_order() {
    let src = r#"
use feature 'class';
no warnings;
class Widget {
    field $label :param;
    field $log = '';
    ADJUST { $self->{log} .= 'first,' }
    ADJUST { $self->{log} .= 'second' }
    method report { return $label . ':' . $self->{log} }
}
print Widget->new(label => 'w')->report;
"#;
    assert_eq!(run_ok(src), "w:first,second");
}

#[test]
fn class_isa_parent_constructor() {
    let src = r#"
use feature 'class';
no warnings;
class Base {
    field $tag :param :reader = 'base';
}
class Derived :isa(Base) {
    method describe { return 'derived of ' . $self->tag }
}
print Derived->new(tag => 'B')->describe;
"#;
    assert_eq!(run_ok(src), "derived of B");
}

#[test]
fn symbolic_and_code_ref_calls() {
    let src = r#"
sub hello { return 'hi ' . $_[0] }
my $ref = \&hello;
print $ref->('one');
my $name = 'hello';
no strict;
print ' ', &$ref('two');
"#;
    assert_eq!(run_ok(src), "hi one hi two");
}

#[test]
fn glob_assignment_aliases_subs() {
    let src = "sub real { 'R' } *alias = \\&real; print alias();";
    assert_eq!(run_ok(src), "R");
}
