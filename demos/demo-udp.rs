use std::error::Error;
use std::thread;
use std::time::Duration;
use udpunch::udp::{Client, Event, Server};

fn main() -> Result<(), Box<dyn Error>> {
    let server_addr = "127.0.0.1:5000";

    {
        let s = Server::new(server_addr)?;
        thread::spawn(move || s.run().unwrap());
    }

    let t = thread::spawn(move || {
        let mut c = Client::new(server_addr, "c1", None, None).unwrap();
        c.register().unwrap();
        loop {
            for e in c.poll(Duration::from_millis(200)).unwrap() {
                if let Event::Message { sender, text, .. } = e {
                    if text == "hello" {
                        assert_eq!(sender, "c2");
                        return;
                    }
                }
            }
        }
    });

    thread::sleep(Duration::from_millis(100));

    let mut c = Client::new(server_addr, "c2", Some("c1"), None)?;
    c.register()?;
    while !c.session().is_connected() {
        c.poll(Duration::from_millis(200))?;
    }
    c.send_text("hello");

    t.join().unwrap();

    Ok(())
}
