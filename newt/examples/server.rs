use newt::core::Core;
use newt::net::Socket;
use newt::server::{Reply, Resource};
use newt_msg::ContentFormat;

fn main() {
  simple_logger::SimpleLogger::new().init().unwrap();

  let sock = newt::std::UdpSocket::bind_raw("0.0.0.0:5683".parse().unwrap()).unwrap();
  let mut core = Core::new(newt::std::Clock::new(), sock);

  core.server_mut()
      .register(Resource::new("hello").discoverable()
                                      .resource_type("x.hello")
                                      .on_get(Box::new(|req| {
                                        log::info!("GET /hello from {}", req.addr());
                                        Reply::content(b"world".to_vec(), ContentFormat::Text)
                                      })));

  // joins fail harmlessly on hosts without the relevant family
  core.join_discovery_groups(&[0]).ok();

  log::info!("serving coap://0.0.0.0:5683/hello");
  loop {
    core.poll().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
  }
}
