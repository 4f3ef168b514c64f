use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    corpusmix::app::run(std::env::args().skip(1))
}
