mod local_file;
mod narrow;

pub use local_file::{LocalFileAdapter, MAX_FILE_SIZE_BYTES};
pub use narrow::{
    ArchiveMailAdapter, CalendarAdapter, CalendarBackend, CalendarRecord, ChatAdapter, ChatBackend,
    ChatRecord, MailBackend, MailRecord, WebAdapter, WebBackend, WebRecord,
};
