use newt::blocking::Client;
use newt::time::Timeout;

fn main() {
  simple_logger::SimpleLogger::new().init().unwrap();

  let mut client = Client::new_std(1111).unwrap();
  let rep = client.get("127.0.0.1:5683".parse().unwrap(),
                       "hello",
                       Timeout::Millis(5_000))
                  .unwrap();

  println!("Hello, {}!",
           String::from_utf8_lossy(rep.data().payload.as_bytes()));
}
