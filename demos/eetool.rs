//! Image-file tool for poking at an emulated EEPROM: create and inspect a
//! three-page image, store and fetch records, force transfers.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{bail, Context};
use clap::Parser;

use mneme::{Config, Flash, PageId, VarEeprom};

const PAGE_SIZE: u32 = 1024;

#[derive(Parser)]
struct Eetool {
    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Create a fully erased three-page image file.
    Blank,
    /// Show the lifecycle state of all three pages.
    Status,
    /// Erase one wear-leveling page behind the engine's back.
    Erase {
        #[clap(arg_enum)]
        page: ArgPage,
    },
    /// Destructive reset to the canonical empty state.
    Format,
    /// Run the boot-time repair pass.
    Repair,
    /// Store a record.
    Write { key: u32, value: String },
    /// Fetch the newest record for a key.
    Read { key: u32 },
    /// Check whether any record exists for a key.
    Exists { key: u32 },
    /// Force a compaction onto the standby page.
    Transfer,
    /// Hex-dump the programmed part of a page.
    Dump {
        #[clap(arg_enum)]
        page: ArgPage,
    },
}

#[derive(Copy, Clone, Debug, clap::ArgEnum)]
enum ArgPage {
    One,
    Two,
    Factory,
}

impl From<ArgPage> for PageId {
    fn from(a: ArgPage) -> Self {
        match a {
            ArgPage::One => Self::One,
            ArgPage::Two => Self::Two,
            ArgPage::Factory => Self::Factory,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Eetool::parse();

    // Commands that manipulate the raw image file, before any engine gets
    // its hands on it.
    match &args.cmd {
        Cmd::Blank => {
            let blank = vec![0xFF; 3 * PAGE_SIZE as usize];
            std::fs::write(&args.image_file, blank).with_context(|| {
                format!("creating image file {}", args.image_file.display())
            })?;
            println!("created blank image {}", args.image_file.display());
            return Ok(());
        }
        Cmd::Erase { page } => {
            let img = FlashImage::open(&args.image_file)?;
            let mut file = img.file.borrow_mut();
            file.seek(SeekFrom::Start(FlashImage::base(PageId::from(*page))))?;
            file.write_all(&[0xFF; PAGE_SIZE as usize])?;
            println!("erased page {page:?}");
            return Ok(());
        }
        _ => (),
    }

    let img = FlashImage::open(&args.image_file).with_context(|| {
        format!("opening image file {}", args.image_file.display())
    })?;

    let mut transferred = [0u32; 64];
    let mut ee = VarEeprom::new(img, &mut transferred, Config::default());

    match args.cmd {
        Cmd::Blank | Cmd::Erase { .. } => unreachable!(),
        Cmd::Status => {
            for page in [PageId::One, PageId::Two, PageId::Factory] {
                println!("{page:?}: {:?}", ee.page_status(page)?);
            }
        }
        Cmd::Format => {
            ee.format()?;
            println!("formatted");
        }
        Cmd::Repair => {
            ee.init()?;
            println!("repair pass complete");
            for page in [PageId::One, PageId::Two] {
                println!("{page:?}: {:?}", ee.page_status(page)?);
            }
        }
        Cmd::Write { key, value } => match ee.write(key, value.as_bytes()) {
            Ok(()) => println!("ok"),
            Err(e) => println!("error: {e:?}"),
        },
        Cmd::Read { key } => {
            let mut out = [0; PAGE_SIZE as usize];
            match ee.read(key, &mut out) {
                Ok(n) => {
                    println!("{}", pretty_hex::pretty_hex(&&out[..usize::from(n)]));
                }
                Err(mneme::var::ReadError::NoIndex) => println!("not found"),
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Exists { key } => match ee.index_exists(key) {
            Ok(yes) => println!("{}", if yes { "exists" } else { "not found" }),
            Err(e) => println!("error: {e:?}"),
        },
        Cmd::Transfer => match ee.page_transfer() {
            Ok(()) => println!("done"),
            Err(e) => println!("error: {e:?}"),
        },
        Cmd::Dump { page } => {
            let page = PageId::from(page);
            println!("page {page:?}: {:?}", ee.page_status(page)?);

            let mut contents = [0; PAGE_SIZE as usize];
            ee.flash().read(page, 0, &mut contents)?;
            let programmed = contents
                .iter()
                .rposition(|&b| b != 0xFF)
                .map(|i| i + 1)
                .unwrap_or(0);
            if programmed == 0 {
                println!("(fully erased)");
            } else {
                println!("{}", pretty_hex::pretty_hex(&&contents[..programmed]));
            }
        }
    }

    Ok(())
}

struct FlashImage {
    file: RefCell<std::fs::File>,
}

impl FlashImage {
    fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        if file.metadata()?.len() != 3 * u64::from(PAGE_SIZE) {
            bail!("image must be exactly three pages of {PAGE_SIZE} bytes");
        }
        Ok(Self { file: file.into() })
    }

    fn base(page: PageId) -> u64 {
        let index: u64 = match page {
            PageId::One => 0,
            PageId::Two => 1,
            PageId::Factory => 2,
        };
        index * u64::from(PAGE_SIZE)
    }
}

impl Flash for FlashImage {
    type Error = std::io::Error;

    const PAGE_SIZE: u32 = PAGE_SIZE;

    fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn erase_page(&mut self, page: PageId) -> Result<(), Self::Error> {
        if page == PageId::Factory {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "factory page is read-only",
            ));
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(Self::base(page)))?;
        file.write_all(&[0xFF; PAGE_SIZE as usize])
    }

    fn read(&self, page: PageId, offset: u32, out: &mut [u8]) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(Self::base(page) + u64::from(offset)))?;
        file.read_exact(out)
    }

    fn write(&mut self, page: PageId, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        if page == PageId::Factory {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "factory page is read-only",
            ));
        }

        // Behave like the real thing: programming may only clear bits.
        let mut current = vec![0; data.len()];
        self.read(page, offset, &mut current)?;
        if data.iter().zip(&current).any(|(d, c)| d & !c != 0) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "write would raise programmed bits",
            ));
        }

        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(Self::base(page) + u64::from(offset)))?;
        file.write_all(data)
    }
}
