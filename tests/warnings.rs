mod common;

use std::sync::Mutex;

use common::{boot, eval};
use log::{Level, LevelFilter, Log, Metadata, Record};

struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if record.level() == Level::Warn {
            if let Ok(mut lines) = self.0.lock() {
                lines.push(record.args().to_string());
            }
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

#[test]
fn test_unmuffled_warning_reported_once() {
    log::set_logger(&CAPTURE).unwrap();
    log::set_max_level(LevelFilter::Warn);

    let ctx = boot();
    assert_eq!(eval(&ctx, "(progn (warn \"careful ~a\" 3) :after)").unwrap(), ":AFTER");
    let _ = eval(&ctx, "(handler-bind ((warning #'muffle-warning)) (warn \"careful hidden\"))");

    let lines = CAPTURE.0.lock().unwrap();
    let reported: Vec<_> = lines.iter().filter(|l| l.contains("careful")).collect();
    assert_eq!(reported, vec!["careful 3"]);
}
